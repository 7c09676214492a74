use skewprobe::client::{run_udp_client, ClientSettings, RunOutcome, SessionLimits};
use skewprobe::clock::now_micros;
use skewprobe::metrics::MetricsLine;
use skewprobe::protocol::{Probe, PROBE_SIZE};
use skewprobe::server::{ServerMonitor, ServerSettings, UdpServer};
use skewprobe::socket::SocketOptions;
use skewprobe::Result;
use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

/// Test helper: start a reflector on an ephemeral loopback port
fn start_server(max_packet: usize) -> (SocketAddr, ServerMonitor) {
    let monitor = ServerMonitor::new();
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.max_packet = max_packet;
    let server = UdpServer::bind(&settings, monitor.counters()).expect("Failed to bind test server");
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.serve());
    (addr, monitor)
}

fn client_settings(addr: SocketAddr, request_count: u64) -> ClientSettings {
    ClientSettings {
        host: addr.ip().to_string(),
        port: addr.port(),
        request_size: PROBE_SIZE,
        response_size: 256,
        limits: SessionLimits {
            request_count,
            concurrency: u64::MAX,
            delay_us: 1_000,
        },
        drain_us: Some(1_000_000),
        wait_for_input: false,
        socket: SocketOptions::default(),
        summary: false,
    }
}

fn probe_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    socket
}

#[test]
fn test_probe_is_stamped_and_echoed() -> Result<()> {
    let (addr, _) = start_server(1024);
    let socket = probe_socket();

    let mut request = vec![0xAAu8; 120];
    let mut probe = Probe::new(42, 300);
    probe.request_write_start = now_micros();
    probe.encode_into(&mut request);
    socket.send_to(&request, addr)?;

    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf)?;
    assert_eq!(len, 300);
    let echoed = Probe::decode(&buf[..len])?;
    assert_eq!(echoed.seq, 42);
    assert_eq!(echoed.request_write_start, probe.request_write_start);
    assert!(echoed.request_wait_start <= echoed.request_rcvd);
    assert!(echoed.request_rcvd <= echoed.request_read_start);
    assert!(echoed.request_read_start <= echoed.request_read_end);
    assert!(echoed.request_read_end <= echoed.response_write_start);
    // Payload past the request's own bytes is zero-filled.
    assert!(buf[120..len].iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn test_response_length_is_clamped() -> Result<()> {
    let (addr, _) = start_server(128);
    let socket = probe_socket();

    let mut request = [0u8; PROBE_SIZE];
    Probe::new(1, 4096).encode_into(&mut request);
    socket.send_to(&request, addr)?;

    let mut buf = [0u8; 8192];
    let (len, _) = socket.recv_from(&mut buf)?;
    assert_eq!(len, 128);
    assert_eq!(Probe::decode(&buf[..len])?.response_len, 128);
    Ok(())
}

#[test]
fn test_undersized_datagram_is_dropped() -> Result<()> {
    let (addr, monitor) = start_server(1024);
    let socket = probe_socket();

    socket.send_to(&[1u8; 10], addr)?;
    let mut buf = [0u8; 2048];
    assert!(socket.recv_from(&mut buf).is_err());

    // The server keeps answering afterwards.
    let mut request = [0u8; PROBE_SIZE];
    Probe::new(7, PROBE_SIZE as u64).encode_into(&mut request);
    socket.send_to(&request, addr)?;
    let (len, _) = socket.recv_from(&mut buf)?;
    assert_eq!(Probe::decode(&buf[..len])?.seq, 7);

    // The counter is bumped after the send returns.
    let deadline = Instant::now() + Duration::from_secs(1);
    while monitor.stats().responses < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let stats = monitor.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.responses, 1);
    Ok(())
}

#[test]
fn test_bounded_client_run() -> Result<()> {
    let (addr, _) = start_server(1024);
    let mut lines: Vec<MetricsLine> = Vec::new();

    let started = Instant::now();
    let summary = run_udp_client(&client_settings(addr, 5), &mut lines)?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.sent, 5);
    assert_eq!(
        lines.iter().map(|line| line.seq).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    for line in &lines {
        assert!(line.request.write_start <= line.response.read_end);
        assert!(line.lower <= 0 && 0 <= line.upper);
    }
    // Four gaps of at least the configured delay between five sends.
    assert!(started.elapsed() >= Duration::from_micros(4_000));
    Ok(())
}

#[test]
fn test_drain_abandons_unanswered_probes() -> Result<()> {
    // Bound, but nobody ever answers.
    let silent = UdpSocket::bind("127.0.0.1:0")?;
    let mut settings = client_settings(silent.local_addr()?, 3);
    settings.limits.delay_us = 0;
    settings.drain_us = Some(50_000);

    let started = Instant::now();
    let mut lines: Vec<MetricsLine> = Vec::new();
    let summary = run_udp_client(&settings, &mut lines)?;

    assert_eq!(summary.outcome, RunOutcome::Drained { abandoned: 3 });
    assert_eq!(summary.sent, 3);
    assert!(lines.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(50));
    Ok(())
}

/// Answers every probe with junk, a probe that was never sent, the real
/// echo and then a duplicate of the echo.
fn noisy_reflector() -> Result<SocketAddr> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    socket.set_read_timeout(Some(Duration::from_secs(2)))?;
    let addr = socket.local_addr()?;
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((len, peer)) = socket.recv_from(&mut buf) {
            let mut probe = Probe::decode(&buf[..len]).unwrap();
            probe.request_read_end = now_micros();
            probe.request_read_start = probe.request_read_end;
            probe.request_rcvd = probe.request_read_end;
            probe.response_write_start = now_micros();

            let mut echo = vec![0u8; probe.response_len as usize];
            socket.send_to(&[7u8; 10], peer).unwrap();
            Probe {
                seq: probe.seq + 1_000,
                ..probe
            }
            .encode_into(&mut echo);
            socket.send_to(&echo, peer).unwrap();
            probe.encode_into(&mut echo);
            socket.send_to(&echo, peer).unwrap();
            socket.send_to(&echo, peer).unwrap();
        }
    });
    Ok(addr)
}

#[test]
fn test_only_sent_probes_are_counted() -> Result<()> {
    let addr = noisy_reflector()?;
    let mut settings = client_settings(addr, 3);
    settings.limits.delay_us = 0;

    let mut lines: Vec<MetricsLine> = Vec::new();
    let summary = run_udp_client(&settings, &mut lines)?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.acked, 3);
    let mut seqs: Vec<u64> = lines.iter().map(|line| line.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2, 3]);
    Ok(())
}

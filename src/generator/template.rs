//! Request templates for the traffic generator.
//!
//! A template is the raw contents of a file in which `%lu` (or any
//! printf-style integer conversion such as `%d`, `%u`, `%zu`) is replaced by
//! the request id and `%s` by the run name. `%%` produces a literal `%`;
//! any other `%` sequence is copied unchanged.

use crate::error::{ProbeError, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(Vec<u8>),
    Id,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTemplate {
    pieces: Vec<Piece>,
}

impl RequestTemplate {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            ProbeError::Config(format!("unable to read '{}': {}", path.display(), e))
        })?;
        if bytes.is_empty() {
            return Err(ProbeError::Config(format!(
                "request template '{}' is empty",
                path.display()
            )));
        }
        let template = Self::parse(&bytes);
        debug!(path = %path.display(), bytes = bytes.len(), "Loaded request template");
        Ok(template)
    }

    pub fn parse(bytes: &[u8]) -> Self {
        let mut pieces = Vec::new();
        let mut text = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'%' {
                text.push(bytes[i]);
                i += 1;
                continue;
            }
            let rest = &bytes[i + 1..];
            let modifiers = rest
                .iter()
                .take_while(|&&b| matches!(b, b'l' | b'z' | b'j' | b'h'))
                .count();
            let (piece, consumed) = match (rest.first(), rest.get(modifiers)) {
                (Some(b'%'), _) => {
                    text.push(b'%');
                    i += 2;
                    continue;
                }
                (Some(b's'), _) => (Piece::Name, 2),
                (_, Some(b'u' | b'd' | b'i')) => (Piece::Id, 2 + modifiers),
                _ => {
                    text.push(b'%');
                    i += 1;
                    continue;
                }
            };
            if !text.is_empty() {
                pieces.push(Piece::Text(std::mem::take(&mut text)));
            }
            pieces.push(piece);
            i += consumed;
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }
        Self { pieces }
    }

    /// Replaces the contents of `out` with the request for `id`.
    pub fn render_into(&self, id: u64, name: &str, out: &mut Vec<u8>) {
        out.clear();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.extend_from_slice(text),
                Piece::Id => out.extend_from_slice(id.to_string().as_bytes()),
                Piece::Name => out.extend_from_slice(name.as_bytes()),
            }
        }
    }

    pub fn render(&self, id: u64, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        self.render_into(id, name, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_id_and_name() {
        let template = RequestTemplate::parse(b"GET /item/%lu?run=%s HTTP/1.0\r\n\r\n");
        assert_eq!(
            template.render(42, "smoke"),
            b"GET /item/42?run=smoke HTTP/1.0\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_integer_conversions() {
        let template = RequestTemplate::parse(b"%d %u %zu %llu %i");
        assert_eq!(template.render(7, "x"), b"7 7 7 7 7".to_vec());
    }

    #[test]
    fn test_literal_percent() {
        let template = RequestTemplate::parse(b"100%% of %x and 5%");
        assert_eq!(template.render(1, "x"), b"100% of %x and 5%".to_vec());
    }

    #[test]
    fn test_render_into_reuses_buffer() {
        let template = RequestTemplate::parse(b"set k%lu\n");
        let mut out = b"stale contents".to_vec();
        template.render_into(3, "", &mut out);
        assert_eq!(out, b"set k3\n".to_vec());
    }

    #[test]
    fn test_load() -> Result<()> {
        let path = std::env::temp_dir().join(format!("skewprobe-template-{}", std::process::id()));
        fs::File::create(&path)?.write_all(b"ping %lu\n")?;
        let template = RequestTemplate::load(&path)?;
        fs::remove_file(&path)?;
        assert_eq!(template.render(9, "x"), b"ping 9\n".to_vec());
        Ok(())
    }

    #[test]
    fn test_load_missing_file() {
        let result = RequestTemplate::load(Path::new("/nonexistent/skewprobe/template"));
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }
}

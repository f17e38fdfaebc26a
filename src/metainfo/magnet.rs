use super::error::MetainfoError;
use super::info_hash::InfoHash;

/// A parsed `magnet:` link.
///
/// Carries only the info hash plus optional display name and trackers;
/// the info dictionary itself is fetched from peers after connecting.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parses a `magnet:?xt=urn:btih:<hex>` link.
    pub fn parse(uri: &str) -> Result<Self, MetainfoError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or(MetainfoError::InvalidMagnet)?;

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key {
                "xt" => {
                    let hex = value
                        .strip_prefix("urn:btih:")
                        .ok_or(MetainfoError::InvalidMagnet)?;
                    info_hash = Some(InfoHash::from_hex(hex)?);
                }
                "dn" => name = Some(percent_decode(value)),
                "tr" => trackers.push(percent_decode(value)),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MetainfoError::InvalidMagnet)?,
            name,
            trackers,
        })
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(b) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(b);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

use super::error::TrackerError;
use super::{Announce, Event, Tracker, Transfer};
use crate::bencode::decode;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const NUMWANT: u32 = 50;

/// An HTTP(S) tracker transport (BEP-3 announce over GET).
pub struct HttpTracker {
    client: reqwest::Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&self, transfer: &Transfer, event: Event) -> Result<Announce, TrackerError> {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            self.url,
            separator,
            percent_encode(transfer.info_hash.as_bytes()),
            percent_encode(transfer.peer_id.as_bytes()),
            transfer.port,
            transfer.uploaded,
            transfer.downloaded,
            transfer.bytes_left,
            NUMWANT,
        );
        if let Some(event) = event.as_query() {
            let _ = write!(url, "&event={}", event);
        }

        let body = self.client.get(&url).send().await?.bytes().await?;
        parse_response(&body)
    }

    fn url(&self) -> &str {
        &self.url
    }
}

pub(super) fn parse_response(body: &[u8]) -> Result<Announce, TrackerError> {
    let root = decode(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict"));
    }

    if let Some(reason) = root.get(b"failure reason").and_then(|v| v.as_str()) {
        return Err(TrackerError::Failure(reason.to_owned()));
    }

    let interval = root
        .get(b"interval")
        .and_then(|v| v.as_int())
        .filter(|&i| i > 0)
        .ok_or(TrackerError::InvalidResponse("missing interval"))?;

    let mut peers = Vec::new();
    match root.get(b"peers") {
        // Compact form: 6 bytes per peer.
        Some(value) if value.as_bytes().is_some() => {
            let raw = value.as_bytes().expect("checked");
            if raw.len() % 6 != 0 {
                return Err(TrackerError::InvalidResponse("bad compact peers length"));
            }
            for chunk in raw.chunks_exact(6) {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
        }
        // Dictionary form.
        Some(value) if value.as_list().is_some() => {
            for peer in value.as_list().expect("checked") {
                let ip = peer
                    .get(b"ip")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<IpAddr>().ok());
                let port = peer
                    .get(b"port")
                    .and_then(|v| v.as_int())
                    .filter(|&p| (0..=i64::from(u16::MAX)).contains(&p));
                if let (Some(ip), Some(port)) = (ip, port) {
                    peers.push(SocketAddr::new(ip, port as u16));
                }
            }
        }
        _ => {}
    }

    // IPv6 peers, 18 bytes each.
    if let Some(raw) = root.get(b"peers6").and_then(|v| v.as_bytes()) {
        if raw.len() % 18 != 0 {
            return Err(TrackerError::InvalidResponse("bad compact peers6 length"));
        }
        for chunk in raw.chunks_exact(18) {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            peers.push(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            ));
        }
    }

    Ok(Announce {
        interval: Duration::from_secs(interval as u64),
        peers,
    })
}

fn percent_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(60), |mut s, &b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            s.push(b as char);
        } else {
            let _ = write!(s, "%{:02X}", b);
        }
        s
    })
}

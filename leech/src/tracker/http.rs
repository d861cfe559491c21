use std::{net::{IpAddr, Ipv4Addr, SocketAddr}, time::Duration};
use bytes::Buf;
use url::Url;
use serde::de;
use serde_derive::Deserialize;
use super::{AnnounceParams, AnnounceResponse, Result, Tracker, TrackerError};

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    // Sent back on later announces if the tracker gave us one.
    id: Option<String>,

}

impl HttpTracker {
    pub fn new(url: Url, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url,
            id: None,
        }
    }

    fn announce_url(&self, params: &AnnounceParams) -> String {
        let separator = if self.url.query().is_some() { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url.as_str(),
            separator,
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.client_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_peers) = params.num_want {
            url.push_str(&format!("&numwant={}", num_peers));
        }
        if let Some(tracker_id) = &self.id {
            url.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
        }
        url
    }
}

#[async_trait::async_trait]
impl Tracker for HttpTracker {

    async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {

        let url = self.announce_url(params);
        tracing::debug!("announce url: {}", url);

        let raw_resp = self.client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;

        let resp: HttpResponse = bencode::decode_bytes(&raw_resp)?;
        tracing::debug!("announce response: {:#?}", resp);

        if let Some(tracker_id) = resp.tracker_id.clone() {
            self.id = Some(tracker_id);
        }
        resp.into_announce()
    }

    fn url(&self) -> &Url { &self.url }
}

// Bencoded body of an announce reply.
#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // Set alone when the tracker refused the announce.
    #[serde(default, rename = "failure reason")]
    pub failure_reason: Option<String>,

    #[serde(default, rename = "warning message")]
    pub warning_message: Option<String>,

    // Seconds until the next regular announce. Decoded loosely so that a
    // string or negative value surfaces as InvalidResponse.
    #[serde(default)]
    pub interval: Option<bencode::Value>,

    #[serde(default, rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Seeders.
    #[serde(default)]
    pub complete: Option<u32>,

    // Leechers.
    #[serde(default)]
    pub incomplete: Option<u32>,

    #[serde(default, deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

impl HttpResponse {

    pub fn into_announce(self) -> Result<AnnounceResponse> {
        if let Some(reason) = self.failure_reason {
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = &self.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }

        let secs = self.interval
            .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?
            .as_int()
            .and_then(|secs| u64::try_from(secs).ok())
            .ok_or_else(|| TrackerError::InvalidResponse("interval is not a non-negative integer".into()))?;

        Ok(AnnounceResponse::new(
            Duration::from_secs(secs),
            self.complete.unwrap_or_default(),
            self.incomplete.unwrap_or_default(),
            self.peers,
        ))
    }
}

// 4 byte IPv4 address then 2 byte port, big endian.
const COMPACT_PEER_LEN: usize = 6;

// Peers arrive either compact, as one byte string, or as a list of
// {ip, port} dictionaries. Trackers may ignore compact=1.
fn deserialize_peers<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeersVisitor;

    impl<'de> de::Visitor<'de> for PeersVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("compact peer bytes or a list of peer dictionaries")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
            if v.len() % COMPACT_PEER_LEN != 0 {
                return Err(E::custom(format!("compact peers length {} is not a multiple of 6", v.len())));
            }
            Ok(v.chunks_exact(COMPACT_PEER_LEN)
                .map(|mut chunk| {
                    let ip = Ipv4Addr::from(chunk.get_u32());
                    SocketAddr::new(IpAddr::V4(ip), chunk.get_u16())
                })
                .collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
            #[derive(Deserialize)]
            struct DictPeer {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(DictPeer { ip, port }) = seq.next_element()? {
                match ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, port)),
                    Err(_) => tracing::trace!("skipping peer host {}", ip),
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeersVisitor)
}

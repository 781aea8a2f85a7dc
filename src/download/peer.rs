//! Peer-hosted sources
//!
//! Bits-of-Binary (`cid:`) payloads and negotiated peer-to-peer transfers
//! (`xmpp:...?jingle-ft`) both need a reachable contributor. The messaging
//! stack that actually talks to peers sits behind [`PeerNetwork`].

use super::transfer::{OpenedTransfer, TransferMetadata};
use crate::error::{ProtocolErrorKind, Result, ShareError};
use crate::protocol::{ByteRange, FileDescriptor, PeerId};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

/// A Bits-of-Binary payload
#[derive(Debug, Clone)]
pub struct BobData {
    pub data: Bytes,
    pub media_type: Option<String>,
}

/// Access to the peers of the messaging network
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Whether `peer` (including its resource) is currently available
    async fn is_online(&self, peer: &PeerId) -> bool;

    /// Fetch a Bits-of-Binary payload by content id
    async fn load_bob(&self, peer: &PeerId, cid: &str) -> Result<BobData>;

    /// Negotiate a peer-to-peer transfer of `file` from `peer`
    ///
    /// Implementations may honour `range` and must report what they
    /// actually deliver in the returned metadata.
    async fn open_transfer(
        &self,
        peer: &PeerId,
        file: &FileDescriptor,
        range: Option<ByteRange>,
    ) -> Result<OpenedTransfer>;
}

/// Peer network with nobody online
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflinePeers;

#[async_trait]
impl PeerNetwork for OfflinePeers {
    async fn is_online(&self, _peer: &PeerId) -> bool {
        false
    }

    async fn load_bob(&self, peer: &PeerId, cid: &str) -> Result<BobData> {
        Err(ShareError::SourceOffline {
            uri: format!("cid:{} at {}", cid, peer),
        })
    }

    async fn open_transfer(
        &self,
        peer: &PeerId,
        _file: &FileDescriptor,
        _range: Option<ByteRange>,
    ) -> Result<OpenedTransfer> {
        Err(ShareError::SourceOffline {
            uri: format!("xmpp:{}", peer),
        })
    }
}

/// First currently online peer, in list order
pub async fn select_online(network: &dyn PeerNetwork, peers: &[PeerId]) -> Option<PeerId> {
    for peer in peers {
        if network.is_online(peer).await {
            return Some(peer.clone());
        }
    }
    None
}

/// A parsed `xmpp:<entity>?jingle-ft[;...]` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JingleUri {
    /// Peer named by the URI, when it is a full user address
    pub entity: Option<PeerId>,
}

/// Parse a peer-to-peer transfer URI
pub fn parse_jingle_uri(uri: &str) -> Result<JingleUri> {
    let parsed = url::Url::parse(uri)?;
    if !parsed.scheme().eq_ignore_ascii_case("xmpp") {
        return Err(ShareError::protocol(
            ProtocolErrorKind::UnsupportedScheme,
            format!("Not an xmpp URI: {}", uri),
        ));
    }

    // xmpp://user@host/res puts the address into the authority
    let address = match parsed.host_str() {
        Some(host) if !parsed.username().is_empty() => {
            format!("{}@{}{}", parsed.username(), host, parsed.path())
        }
        _ => parsed.path().trim_start_matches('/').to_string(),
    };
    let address = percent_decode(&address);

    let query = parsed.query().unwrap_or_default();
    let action = query.split(';').next().unwrap_or_default();
    let action = action.split_once('=').map_or(action, |(key, _)| key);
    if action != "jingle-ft" {
        return Err(ShareError::protocol(
            ProtocolErrorKind::InvalidUri,
            format!("Invalid Jingle-FT URI: {}", uri),
        ));
    }

    let entity = match address.split_once('@') {
        Some((node, domain)) if !node.is_empty() && !domain.is_empty() => {
            Some(PeerId::new(address.clone()))
        }
        _ => None,
    };
    Ok(JingleUri { entity })
}

fn percent_decode(s: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", s.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| s.to_string())
}

/// Fetch a `cid:` source from an online contributor
pub async fn open_bob(
    network: &dyn PeerNetwork,
    contributors: &[PeerId],
    uri: &str,
) -> Result<OpenedTransfer> {
    let peer = select_online(network, contributors)
        .await
        .ok_or_else(|| ShareError::SourceOffline {
            uri: uri.to_string(),
        })?;
    let cid = uri.get(4..).unwrap_or_default();
    if cid.is_empty() {
        return Err(ShareError::protocol(
            ProtocolErrorKind::InvalidUri,
            format!("Empty content id: {}", uri),
        ));
    }

    tracing::debug!("Loading bits of binary {} from {}", cid, peer);
    let bob = network.load_bob(&peer, cid).await?;
    let metadata = TransferMetadata {
        range: None,
        total_size: Some(bob.data.len() as u64),
        media_type: bob.media_type,
        last_modified: None,
    };
    let body = futures::stream::once(async move { Ok(bob.data) }).boxed();
    Ok(OpenedTransfer { metadata, body })
}

/// Start a peer-to-peer transfer for an `xmpp:` source
pub async fn open_jingle(
    network: &dyn PeerNetwork,
    contributors: &[PeerId],
    uri: &str,
    file: &FileDescriptor,
    range: Option<ByteRange>,
) -> Result<OpenedTransfer> {
    let parsed = parse_jingle_uri(uri)?;
    let mut peers = Vec::with_capacity(contributors.len() + 1);
    if let Some(entity) = parsed.entity {
        peers.push(entity);
    }
    peers.extend(contributors.iter().cloned());

    let peer = select_online(network, &peers)
        .await
        .ok_or_else(|| ShareError::SourceOffline {
            uri: uri.to_string(),
        })?;

    tracing::debug!("Requesting peer transfer from {} (range={:?})", peer, range);
    network.open_transfer(&peer, file, range).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Peers {
        online: Vec<PeerId>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerNetwork for Peers {
        async fn is_online(&self, peer: &PeerId) -> bool {
            self.online.contains(peer)
        }

        async fn load_bob(&self, peer: &PeerId, cid: &str) -> Result<BobData> {
            self.calls.lock().push(format!("bob {} {}", peer, cid));
            Ok(BobData {
                data: Bytes::from_static(b"tiny"),
                media_type: Some("image/png".into()),
            })
        }

        async fn open_transfer(
            &self,
            peer: &PeerId,
            _file: &FileDescriptor,
            _range: Option<ByteRange>,
        ) -> Result<OpenedTransfer> {
            self.calls.lock().push(format!("jingle {}", peer));
            Ok(OpenedTransfer {
                metadata: TransferMetadata::default(),
                body: futures::stream::empty().boxed(),
            })
        }
    }

    #[test]
    fn test_parse_jingle_uri() {
        let parsed = parse_jingle_uri("xmpp:alice@example.org/phone?jingle-ft").unwrap();
        assert_eq!(parsed.entity, Some(PeerId::new("alice@example.org/phone")));

        let with_params = parse_jingle_uri("xmpp:alice@example.org/pc?jingle-ft;id=42").unwrap();
        assert_eq!(with_params.entity, Some(PeerId::new("alice@example.org/pc")));

        let authority = parse_jingle_uri("xmpp://alice@example.org/pc?jingle-ft").unwrap();
        assert_eq!(authority.entity, Some(PeerId::new("alice@example.org/pc")));

        let server_only = parse_jingle_uri("xmpp:example.org?jingle-ft").unwrap();
        assert_eq!(server_only.entity, None);
    }

    #[test]
    fn test_parse_jingle_uri_rejects_other_actions() {
        assert!(parse_jingle_uri("xmpp:alice@example.org?message").is_err());
        assert!(parse_jingle_uri("xmpp:alice@example.org").is_err());
        assert!(parse_jingle_uri("https://example.org/?jingle-ft").is_err());
    }

    #[tokio::test]
    async fn test_bob_requires_online_peer() {
        let peers = Peers::default();
        let err = open_bob(&peers, &[PeerId::new("a@b/c")], "cid:abc@bob.xmpp.org")
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::SourceOffline { .. }));
        assert!(peers.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bob_loads_from_online_peer() {
        let peers = Peers {
            online: vec![PeerId::new("b@x/2")],
            ..Default::default()
        };
        let transfer = open_bob(
            &peers,
            &[PeerId::new("a@x/1"), PeerId::new("b@x/2")],
            "cid:abc@bob.xmpp.org",
        )
        .await
        .unwrap();
        assert_eq!(transfer.metadata.total_size, Some(4));
        assert_eq!(transfer.metadata.media_type.as_deref(), Some("image/png"));
        let data: Vec<Bytes> = transfer.body.try_collect().await.unwrap();
        assert_eq!(data.concat(), b"tiny");
        assert_eq!(peers.calls.lock().as_slice(), ["bob b@x/2 abc@bob.xmpp.org"]);
    }

    #[tokio::test]
    async fn test_jingle_prefers_uri_entity() {
        let peers = Peers {
            online: vec![PeerId::new("a@x/1"), PeerId::new("owner@x/pc")],
            ..Default::default()
        };
        open_jingle(
            &peers,
            &[PeerId::new("a@x/1")],
            "xmpp:owner@x/pc?jingle-ft",
            &FileDescriptor::new("f"),
            None,
        )
        .await
        .unwrap();
        assert_eq!(peers.calls.lock().as_slice(), ["jingle owner@x/pc"]);
    }

    #[tokio::test]
    async fn test_jingle_offline() {
        let err = open_jingle(
            &OfflinePeers,
            &[PeerId::new("a@x/1")],
            "xmpp:owner@x/pc?jingle-ft",
            &FileDescriptor::new("f"),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShareError::SourceOffline { .. }));
    }
}

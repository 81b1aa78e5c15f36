//! Byte-level framing of the sync protocol
//!
//! Requests and responses are serde enums; a [`DiffCodec`] turns them into
//! bytes and a [`Transport`] carries those bytes to a server, which answers
//! through [`serve`].

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{NodeError, SyncNode};
use crate::commit::CommitId;
use crate::ot::OtError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SyncRequest<D> {
    Checkout,
    CheckoutAt { id: CommitId },
    Pull { old: CommitId },
    Push { current: CommitId, diffs: Vec<D> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse<D> {
    /// Answer to checkouts and pull.
    State { head: CommitId, diffs: Vec<D> },
    Pushed { head: CommitId },
    Failed(WireError),
}

/// [`NodeError`] as it travels over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    Conflict,
    Network(String),
    Graph(String),
    TransformUndefined { left: String, right: String },
    Codec(String),
}

impl From<NodeError> for WireError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Conflict => WireError::Conflict,
            NodeError::Network(reason) => WireError::Network(reason),
            NodeError::Graph(reason) => WireError::Graph(reason),
            NodeError::Transform(OtError::TransformUndefined { left, right }) => {
                WireError::TransformUndefined { left, right }
            }
            NodeError::Codec(reason) => WireError::Codec(reason),
        }
    }
}

impl From<WireError> for NodeError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Conflict => NodeError::Conflict,
            WireError::Network(reason) => NodeError::Network(reason),
            WireError::Graph(reason) => NodeError::Graph(reason),
            WireError::TransformUndefined { left, right } => {
                NodeError::Transform(OtError::TransformUndefined { left, right })
            }
            WireError::Codec(reason) => NodeError::Codec(reason),
        }
    }
}

/// Serialization format for protocol messages.
pub trait DiffCodec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, NodeError>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, NodeError>;
}

/// Compact binary encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct CborCodec;

impl DiffCodec for CborCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, NodeError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes).map_err(|e| NodeError::Codec(e.to_string()))?;
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, NodeError> {
        ciborium::from_reader(bytes).map_err(|e| NodeError::Codec(e.to_string()))
    }
}

/// Human-readable encoding, handy for debugging.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl DiffCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, NodeError> {
        serde_json::to_vec(value).map_err(|e| NodeError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, NodeError> {
        serde_json::from_slice(bytes).map_err(|e| NodeError::Codec(e.to_string()))
    }
}

/// Answer one encoded request from `node`.
///
/// Protocol failures are encoded into the response; only a failure to
/// encode the response itself is returned as an error.
pub async fn serve<D, N, C>(node: &N, codec: &C, request: &[u8]) -> Result<Vec<u8>, NodeError>
where
    D: Serialize + DeserializeOwned + Send + 'static,
    N: SyncNode<D> + ?Sized,
    C: DiffCodec,
{
    let response: SyncResponse<D> = match codec.decode::<SyncRequest<D>>(request) {
        Err(e) => {
            log::warn!("Dropping undecodable sync request: {}", e);
            SyncResponse::Failed(e.into())
        }
        Ok(SyncRequest::Checkout) => match node.checkout().await {
            Ok((head, diffs)) => SyncResponse::State { head, diffs },
            Err(e) => SyncResponse::Failed(e.into()),
        },
        Ok(SyncRequest::CheckoutAt { id }) => match node.checkout_at(&id).await {
            Ok(diffs) => SyncResponse::State { head: id, diffs },
            Err(e) => SyncResponse::Failed(e.into()),
        },
        Ok(SyncRequest::Pull { old }) => match node.pull(&old).await {
            Ok((head, diffs)) => SyncResponse::State { head, diffs },
            Err(e) => SyncResponse::Failed(e.into()),
        },
        Ok(SyncRequest::Push { current, diffs }) => match node.push(&current, diffs).await {
            Ok(head) => SyncResponse::Pushed { head },
            Err(e) => SyncResponse::Failed(e.into()),
        },
    };
    codec.encode(&response)
}

/// Carries one encoded request to a server and returns its encoded answer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Failures to reach the server are reported as [`NodeError::Network`].
    async fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, NodeError>;
}

/// In-process transport that hands requests straight to [`serve`].
pub struct LoopbackTransport<N: ?Sized, C, D> {
    node: Arc<N>,
    codec: C,
    _diff: PhantomData<fn() -> D>,
}

impl<N: ?Sized, C, D> LoopbackTransport<N, C, D> {
    pub fn new(node: Arc<N>, codec: C) -> Self {
        Self {
            node,
            codec,
            _diff: PhantomData,
        }
    }
}

#[async_trait]
impl<N, C, D> Transport for LoopbackTransport<N, C, D>
where
    N: SyncNode<D> + ?Sized + 'static,
    C: DiffCodec + 'static,
    D: Serialize + DeserializeOwned + Send + 'static,
{
    async fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, NodeError> {
        serve::<D, N, C>(self.node.as_ref(), &self.codec, &request).await
    }
}

/// Client-side [`SyncNode`] speaking the encoded protocol over a transport.
pub struct WireNode<T, C> {
    transport: T,
    codec: C,
}

impl<T: Transport, C: DiffCodec> WireNode<T, C> {
    pub fn new(transport: T, codec: C) -> Self {
        Self { transport, codec }
    }

    async fn round_trip<D>(&self, request: SyncRequest<D>) -> Result<SyncResponse<D>, NodeError>
    where
        D: Serialize + DeserializeOwned + Send + 'static,
    {
        let bytes = self.codec.encode(&request)?;
        let reply = self.transport.call(bytes).await?;
        self.codec.decode(&reply)
    }
}

fn unexpected<D>(response: SyncResponse<D>) -> NodeError {
    match response {
        SyncResponse::Failed(e) => e.into(),
        SyncResponse::State { .. } => NodeError::Codec("unexpected state response".to_string()),
        SyncResponse::Pushed { .. } => NodeError::Codec("unexpected push response".to_string()),
    }
}

#[async_trait]
impl<T, C, D> SyncNode<D> for WireNode<T, C>
where
    T: Transport,
    C: DiffCodec,
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn checkout(&self) -> Result<(CommitId, Vec<D>), NodeError> {
        match self.round_trip(SyncRequest::Checkout).await? {
            SyncResponse::State { head, diffs } => Ok((head, diffs)),
            other => Err(unexpected(other)),
        }
    }

    async fn checkout_at(&self, id: &CommitId) -> Result<Vec<D>, NodeError> {
        match self.round_trip(SyncRequest::CheckoutAt { id: *id }).await? {
            SyncResponse::State { head, diffs } if head == *id => Ok(diffs),
            SyncResponse::State { .. } => Err(NodeError::Codec(
                "checkout answered for a different commit".to_string(),
            )),
            other => Err(unexpected(other)),
        }
    }

    async fn pull(&self, old: &CommitId) -> Result<(CommitId, Vec<D>), NodeError> {
        match self.round_trip(SyncRequest::Pull { old: *old }).await? {
            SyncResponse::State { head, diffs } => Ok((head, diffs)),
            other => Err(unexpected(other)),
        }
    }

    async fn push(&self, current: &CommitId, diffs: Vec<D>) -> Result<CommitId, NodeError> {
        let request = SyncRequest::Push {
            current: *current,
            diffs,
        };
        match self.round_trip(request).await? {
            SyncResponse::Pushed { head } => Ok(head),
            other => Err(unexpected(other)),
        }
    }
}

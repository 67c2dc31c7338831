use async_trait::async_trait;
use crosscode_ops::{Backend, BackendError, InvocationToken, InvokeRequest, Subscription, Topic};
use crosscode_proto::crosscode::v1::{
    bridge_service_client::BridgeServiceClient, CancelRequest, EmitRequest,
    InvokeRequest as WireInvokeRequest, ListCommandsRequest, ListOperationsRequest,
    OperationInfo, SubscribeRequest,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::wire::{backend_from_status, decode_json, encode_json};

/// [`Backend`] reached over the bridge gRPC service.
#[derive(Clone)]
pub struct GrpcBackend {
    client: BridgeServiceClient<Channel>,
}

impl GrpcBackend {
    pub async fn connect(addr: &str) -> Result<Self, BackendError> {
        let endpoint = crosscode_util::endpoint_uri(addr);
        let channel = Channel::from_shared(endpoint)
            .map_err(|err| BackendError::Unavailable(format!("invalid address {addr}: {err}")))?
            .connect()
            .await
            .map_err(|err| BackendError::Unavailable(format!("{addr}: {err}")))?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            client: BridgeServiceClient::new(channel),
        }
    }

    pub async fn list_operations(&self) -> Result<Vec<OperationInfo>, BackendError> {
        let resp = self
            .client
            .clone()
            .list_operations(ListOperationsRequest {})
            .await
            .map_err(|status| backend_from_status("list_operations", status))?;
        Ok(resp.into_inner().operations)
    }

    pub async fn list_commands(&self) -> Result<Vec<String>, BackendError> {
        let resp = self
            .client
            .clone()
            .list_commands(ListCommandsRequest {})
            .await
            .map_err(|status| backend_from_status("list_commands", status))?;
        Ok(resp.into_inner().commands)
    }
}

#[async_trait]
impl Backend for GrpcBackend {
    async fn invoke(&self, request: InvokeRequest) -> Result<Value, BackendError> {
        let command = request.command;
        let resp = self
            .client
            .clone()
            .invoke(WireInvokeRequest {
                command: command.clone(),
                params_json: encode_json(&request.params),
                invocation: request.invocation.to_string(),
            })
            .await
            .map_err(|status| backend_from_status(&command, status))?;
        decode_json(&resp.into_inner().result_json)
    }

    async fn listen(&self, topic: &Topic) -> Result<Subscription, BackendError> {
        let channel = topic.channel_name();
        let mut stream = self
            .client
            .clone()
            .subscribe(SubscribeRequest {
                channel: channel.clone(),
            })
            .await
            .map_err(|status| BackendError::Subscribe {
                topic: channel.clone(),
                message: status.message().to_string(),
            })?
            .into_inner();

        let (tx, rx) = mpsc::unbounded_channel();
        let forward = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(event) => event,
                    Err(status) => {
                        warn!(%channel, "event stream ended: {}", status.message());
                        break;
                    }
                };
                match decode_json(&event.payload_json) {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%channel, "dropping undecodable event: {err}"),
                }
            }
            debug!(%channel, "event stream closed");
        });

        // Aborting the forwarder drops the stream, which ends the server side.
        let abort = forward.abort_handle();
        Ok(Subscription::new(topic.clone(), rx, move || abort.abort()))
    }

    async fn cancel(&self, invocation: InvocationToken) -> Result<bool, BackendError> {
        let resp = self
            .client
            .clone()
            .cancel(CancelRequest {
                invocation: invocation.to_string(),
            })
            .await
            .map_err(|status| backend_from_status("cancel", status))?;
        Ok(resp.into_inner().accepted)
    }

    async fn emit(&self, topic: &Topic, payload: Value) -> Result<(), BackendError> {
        self.client
            .clone()
            .emit(EmitRequest {
                channel: topic.channel_name(),
                payload_json: encode_json(&payload),
            })
            .await
            .map_err(|status| backend_from_status("emit", status))?;
        Ok(())
    }
}

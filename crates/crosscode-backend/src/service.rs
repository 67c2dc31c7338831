use crosscode_ops::{registry, Backend, InvocationToken, InvokeRequest, LocalBackend, Topic};
use crosscode_proto::crosscode::v1::{
    bridge_service_server::BridgeService, CancelRequest, CancelResponse, ChannelEvent,
    EmitRequest, EmitResponse, InvokeRequest as WireInvokeRequest, InvokeResponse,
    ListCommandsRequest, ListCommandsResponse, ListOperationsRequest, ListOperationsResponse,
    OperationInfo, StepInfo, SubscribeRequest,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::wire::{decode_json, encode_json, status_from_backend};

const STREAM_BUFFER: usize = 1024;

/// Serves a [`LocalBackend`] over gRPC.
#[derive(Clone)]
pub struct BridgeSvc {
    backend: LocalBackend,
}

impl BridgeSvc {
    pub fn new(backend: LocalBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &LocalBackend {
        &self.backend
    }
}

fn parse_token(raw: &str) -> Result<InvocationToken, Status> {
    InvocationToken::parse(raw)
        .ok_or_else(|| Status::invalid_argument(format!("invalid invocation token: {raw:?}")))
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[tonic::async_trait]
impl BridgeService for BridgeSvc {
    async fn invoke(
        &self,
        request: Request<WireInvokeRequest>,
    ) -> Result<Response<InvokeResponse>, Status> {
        let req = request.into_inner();
        let command = req.command.trim().to_string();
        if command.is_empty() {
            return Err(Status::invalid_argument("command is required"));
        }
        let invocation = if req.invocation.trim().is_empty() {
            InvocationToken::new()
        } else {
            parse_token(&req.invocation)?
        };
        let params = decode_json(&req.params_json).map_err(status_from_backend)?;

        info!(%command, %invocation, "invoke");
        let result = self
            .backend
            .invoke(InvokeRequest {
                command,
                params,
                invocation,
            })
            .await
            .map_err(status_from_backend)?;
        Ok(Response::new(InvokeResponse {
            result_json: encode_json(&result),
        }))
    }

    async fn cancel(
        &self,
        request: Request<CancelRequest>,
    ) -> Result<Response<CancelResponse>, Status> {
        let invocation = parse_token(&request.into_inner().invocation)?;
        let accepted = self
            .backend
            .cancel(invocation)
            .await
            .map_err(status_from_backend)?;
        info!(%invocation, accepted, "cancel");
        Ok(Response::new(CancelResponse { accepted }))
    }

    type SubscribeStream = ReceiverStream<Result<ChannelEvent, Status>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let channel = request.into_inner().channel;
        if channel.trim().is_empty() {
            return Err(Status::invalid_argument("channel is required"));
        }
        let topic = Topic::parse(&channel);
        // Subscribe before responding so the caller sees every event emitted
        // after its call returns.
        let mut subscription = self.backend.events().subscribe(topic.clone());
        let (tx, out_rx) = mpsc::channel::<Result<ChannelEvent, Status>>(STREAM_BUFFER);
        debug!(%topic, "subscriber attached");

        tokio::spawn(async move {
            let channel = topic.channel_name();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    payload = subscription.recv() => {
                        let Some(payload) = payload else { break };
                        let event = ChannelEvent {
                            channel: channel.clone(),
                            payload_json: encode_json(&payload),
                            at_unix_millis: now_millis(),
                        };
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            subscription.unsubscribe();
            debug!(%topic, "subscriber detached");
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }

    async fn emit(&self, request: Request<EmitRequest>) -> Result<Response<EmitResponse>, Status> {
        let req = request.into_inner();
        if req.channel.trim().is_empty() {
            return Err(Status::invalid_argument("channel is required"));
        }
        let topic = Topic::parse(&req.channel);
        let payload = decode_json(&req.payload_json).map_err(status_from_backend)?;
        let delivered = self.backend.events().emit(&topic, payload);
        debug!(%topic, delivered, "front-end event");
        Ok(Response::new(EmitResponse {
            delivered: delivered as u32,
        }))
    }

    async fn list_operations(
        &self,
        _request: Request<ListOperationsRequest>,
    ) -> Result<Response<ListOperationsResponse>, Status> {
        let operations = registry::all()
            .iter()
            .map(|op| OperationInfo {
                id: op.id.to_string(),
                title: op.title.to_string(),
                entry_point: op.entry_point(),
                steps: op
                    .steps
                    .iter()
                    .map(|step| StepInfo {
                        id: step.id.to_string(),
                        label: step.label.to_string(),
                    })
                    .collect(),
            })
            .collect();
        Ok(Response::new(ListOperationsResponse { operations }))
    }

    async fn list_commands(
        &self,
        _request: Request<ListCommandsRequest>,
    ) -> Result<Response<ListCommandsResponse>, Status> {
        Ok(Response::new(ListCommandsResponse {
            commands: self.backend.commands(),
        }))
    }
}

//! gRPC frame ingress.
//!
//! Unary and streaming submission share one admission path: breaker
//! check, publish to the bus with a reply deadline, FrameAck back.
//! Transport failures feed the breaker; accepted=false does not.

use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use wire::{subjects, AnalyzeAck, AnalyzeRequest, EyeSide, Trace};

use crate::capture::capture_service_server::CaptureService;
use crate::capture::{CaptureFrame, FrameAck, StatusReply, StatusRequest};
use crate::state::GatewayState;

pub struct CaptureServiceImpl {
    state: Arc<GatewayState>,
}

impl CaptureServiceImpl {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }
}

/// One frame through admission control and onto the bus.
pub async fn admit_frame(state: &GatewayState, frame: CaptureFrame) -> FrameAck {
    let frame_id = frame.frame_id;

    if !state.breaker.try_admit() {
        return FrameAck {
            frame_id,
            accepted: false,
            queue_depth: 0,
        };
    }

    let Some(eye_side) = EyeSide::parse(&frame.eye_side) else {
        warn!(
            "frame {} has unknown eye side {:?}, refusing",
            Trace(&frame.device_id, frame_id),
            frame.eye_side
        );
        return FrameAck {
            frame_id,
            accepted: false,
            queue_depth: 0,
        };
    };

    let request = AnalyzeRequest {
        frame_id,
        device_id: frame.device_id.clone(),
        jpeg_b64: B64.encode(&frame.jpeg_data),
        eye_side,
        is_nir: frame.is_nir,
        timestamp_us: frame.timestamp_us,
        detailed: false,
        wait: false,
    };

    let started = Instant::now();
    match state
        .bus
        .request_json::<_, AnalyzeAck>(subjects::ANALYZE, &request, state.cfg.analyze_timeout)
        .await
    {
        Ok(ack) => {
            state.breaker.record_success();
            state.stats.observe_frame(started.elapsed());
            FrameAck {
                frame_id,
                accepted: ack.accepted,
                queue_depth: ack.queue_depth,
            }
        }
        Err(e) => {
            warn!(
                "analyze publish failed for {}: {e}",
                Trace(&frame.device_id, frame_id)
            );
            state.breaker.record_failure();
            FrameAck {
                frame_id,
                accepted: false,
                queue_depth: 0,
            }
        }
    }
}

#[tonic::async_trait]
impl CaptureService for CaptureServiceImpl {
    async fn submit_frame(
        &self,
        request: Request<CaptureFrame>,
    ) -> Result<Response<FrameAck>, Status> {
        let frame = request.into_inner();
        Ok(Response::new(admit_frame(&self.state, frame).await))
    }

    type StreamFramesStream = ReceiverStream<Result<FrameAck, Status>>;

    async fn stream_frames(
        &self,
        request: Request<tonic::Streaming<CaptureFrame>>,
    ) -> Result<Response<Self::StreamFramesStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let state = self.state.clone();

        tokio::spawn(async move {
            loop {
                let frame = match inbound.message().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        info!("capture stream closed by device");
                        break;
                    }
                    Err(e) => {
                        warn!("capture stream error: {e}");
                        break;
                    }
                };
                let ack = admit_frame(&state, frame).await;
                if tx.send(Ok(ack)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        let state = &self.state;
        Ok(Response::new(StatusReply {
            alive: true,
            ready: state.bus.is_connected(),
            frames_processed: state
                .stats
                .frames_processed
                .load(std::sync::atomic::Ordering::Relaxed),
            avg_latency_ms: state.stats.avg_latency_ms(),
            breaker_state: state.breaker.state().as_str().to_string(),
        }))
    }
}

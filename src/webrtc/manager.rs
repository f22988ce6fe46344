//! Peer-connection lifecycle on a dedicated runtime.
//!
//! Codec async primitives never touch the host's loop: the manager owns a
//! single-worker runtime on a background thread, and every public operation
//! is a synchronous wrapper that hands work across. Offers travel back
//! through the caller's offer callback; the view queues them for its
//! periodic tick rather than being called directly, because dispatch must
//! happen on the host's thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::TrackLocal;

use super::codec::set_bitrate_defaults;
use super::sdp::apply_bitrate;
use super::track::VideoTrackWorker;
use super::{RtcSessionPayload, WebRtcLayerConfig};

/// Deadline for offer creation; a timed-out layer is re-queued by the
/// caller and retried on its periodic tick.
const OFFER_DEADLINE: Duration = Duration::from_secs(5);
/// Upper bound on ICE gathering before the offer ships with the candidates
/// collected so far.
const GATHER_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for synchronous calls into the manager runtime.
const CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Offer-creation outcome delivered to the caller. `offer == None` means
/// setup failed and the layer should be re-queued for retry.
#[derive(Debug, Clone)]
pub struct OfferEvent {
    pub layer_id: String,
    pub offer: Option<RtcSessionPayload>,
}

pub type OfferCallback = Arc<dyn Fn(OfferEvent) + Send + Sync>;

struct ConnectionEntry {
    pc: Arc<RTCPeerConnection>,
    feeder: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    config: Arc<WebRtcLayerConfig>,
}

/// Manages WebRTC peer connections, one per layer.
pub struct WebRtcManager {
    handle: Handle,
    stun_server: String,
    connections: Arc<Mutex<HashMap<String, ConnectionEntry>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WebRtcManager {
    /// Spawn the dedicated runtime thread.
    pub fn new(stun_server: impl Into<String>) -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("webrtc-runtime".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "failed to build webrtc runtime");
                        return;
                    }
                };
                if handle_tx.send(runtime.handle().clone()).is_err() {
                    return;
                }
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })
            .context("spawn webrtc runtime thread")?;

        let handle = handle_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| anyhow!("webrtc runtime did not come up"))?;

        Ok(WebRtcManager {
            handle,
            stun_server: stun_server.into(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Create a peer connection for a layer and deliver the bitrate-shaped
    /// offer (or a failure marker) through `on_offer`. Returns immediately;
    /// the work runs on the manager runtime.
    pub fn create_connection(
        &self,
        layer_id: &str,
        config: Arc<WebRtcLayerConfig>,
        on_offer: OfferCallback,
    ) {
        // Module-level bitrate state must be in place before the encoder for
        // this connection is constructed.
        set_bitrate_defaults(config.bitrate);

        let layer_id = layer_id.to_owned();
        let stun_server = self.stun_server.clone();
        let connections = Arc::clone(&self.connections);
        self.handle.spawn(async move {
            match Self::create_connection_task(&layer_id, config, stun_server, &connections).await {
                Ok(offer) => {
                    on_offer(OfferEvent {
                        layer_id,
                        offer: Some(offer),
                    });
                }
                Err(e) => {
                    error!(layer_id = %layer_id, error = %e, "webrtc connection setup failed");
                    let entry = connections.lock().remove(&layer_id);
                    if let Some(entry) = entry {
                        entry.feeder.abort();
                        let _ = entry.pc.close().await;
                    }
                    on_offer(OfferEvent {
                        layer_id,
                        offer: None,
                    });
                }
            }
        });
    }

    async fn create_connection_task(
        layer_id: &str,
        config: Arc<WebRtcLayerConfig>,
        stun_server: String,
        connections: &Arc<Mutex<HashMap<String, ConnectionEntry>>>,
    ) -> Result<RtcSessionPayload> {
        debug!(layer_id, codec = %config.codec, "creating webrtc connection");

        // Advertise only the codec we will actually send, so the negotiated
        // codec always matches the encoded stream.
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: config.codec.mime_type().to_owned(),
                    clock_rate: config.codec.clock_rate(),
                    channels: 0,
                    sdp_fmtp_line: config.codec.sdp_fmtp().to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![stun_server],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let worker = VideoTrackWorker::new(Arc::clone(&config))?;
        let track = worker.track();
        pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("add video track")?;
        let feeder = tokio::spawn(worker.run());

        {
            let conns = Arc::clone(connections);
            let lid = layer_id.to_owned();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let conns = Arc::clone(&conns);
                let lid = lid.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Failed => {
                            warn!(layer_id = %lid, "peer connection failed, dropping");
                            let entry = conns.lock().remove(&lid);
                            if let Some(entry) = entry {
                                entry.feeder.abort();
                                let _ = entry.pc.close().await;
                            }
                        }
                        RTCPeerConnectionState::Connected => {
                            info!(layer_id = %lid, "peer connection established");
                        }
                        _ => {
                            debug!(layer_id = %lid, state = %state, "peer connection state changed");
                        }
                    }
                })
            }));
        }

        {
            let lid = layer_id.to_owned();
            pc.on_ice_connection_state_change(Box::new(move |state| {
                let lid = lid.clone();
                Box::pin(async move {
                    debug!(layer_id = %lid, state = %state, "ice state changed");
                })
            }));
        }

        connections.lock().insert(
            layer_id.to_owned(),
            ConnectionEntry {
                pc: Arc::clone(&pc),
                feeder,
                config: Arc::clone(&config),
            },
        );

        let offer = tokio::time::timeout(OFFER_DEADLINE, pc.create_offer(None))
            .await
            .context("offer deadline exceeded")??;
        pc.set_local_description(offer).await?;

        // Candidates ride inside the SDP, so gathering has to finish (or hit
        // its deadline) before the offer ships.
        let mut gather_complete = pc.gathering_complete_promise().await;
        if tokio::time::timeout(GATHER_DEADLINE, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(layer_id, "ice gathering incomplete, sending partial offer");
        }

        let local = pc
            .local_description()
            .await
            .context("no local description after gathering")?;
        let shaped = apply_bitrate(&local.sdp, config.bitrate);
        info!(layer_id, kbps = config.bitrate / 1000, "webrtc offer ready");

        Ok(RtcSessionPayload {
            sdp: shaped,
            kind: local.sdp_type.to_string(),
        })
    }

    /// Apply the client's SDP answer. Unknown layers are logged and ignored.
    pub fn handle_answer(&self, layer_id: &str, answer: RtcSessionPayload) {
        let pc = match self.connections.lock().get(layer_id) {
            Some(entry) => Arc::clone(&entry.pc),
            None => {
                warn!(layer_id, "answer for unknown webrtc layer");
                return;
            }
        };
        let layer_id = layer_id.to_owned();
        self.handle.spawn(async move {
            let description = match RTCSessionDescription::answer(answer.sdp) {
                Ok(description) => description,
                Err(e) => {
                    error!(layer_id = %layer_id, error = %e, "invalid answer sdp");
                    return;
                }
            };
            match pc.set_remote_description(description).await {
                Ok(()) => info!(layer_id = %layer_id, "webrtc connection negotiated"),
                Err(e) => error!(layer_id = %layer_id, error = %e, "set remote description failed"),
            }
        });
    }

    /// Close one connection and its track worker.
    pub fn close_connection(&self, layer_id: &str) {
        let Some(entry) = self.connections.lock().remove(layer_id) else {
            return;
        };
        entry.feeder.abort();
        let layer_id = layer_id.to_owned();
        self.handle.spawn(async move {
            let _ = entry.pc.close().await;
            debug!(layer_id = %layer_id, "webrtc connection closed");
        });
    }

    /// Close every connection, waiting up to the call deadline.
    pub fn close_all(&self) {
        let entries: Vec<(String, ConnectionEntry)> = self.connections.lock().drain().collect();
        if entries.is_empty() {
            return;
        }
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        self.handle.spawn(async move {
            for (layer_id, entry) in entries {
                entry.feeder.abort();
                let _ = entry.pc.close().await;
                debug!(layer_id = %layer_id, "webrtc connection closed");
            }
            let _ = done_tx.send(());
        });
        if done_rx.recv_timeout(CALL_DEADLINE).is_err() {
            warn!("timed out waiting for webrtc connections to close");
        }
    }

    /// Tear down all connections and stop the runtime thread.
    pub fn shutdown(&self) {
        self.close_all();
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn has_connection(&self, layer_id: &str) -> bool {
        self.connections.lock().contains_key(layer_id)
    }
}

impl Drop for WebRtcManager {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

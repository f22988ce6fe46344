//! End-to-end engine tests: pull delivery against a playing source, paused
//! zoom refresh, derived-layer wiring, and WebRTC offer negotiation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::sleep;

use framestack::frame::{Frame, PixelFormat};
use framestack::layer::LayerSpec;
use framestack::protocol::{ClientCommand, ClientEvent, ClientSink};
use framestack::streams::{FrameSource, VideoDecoder, VideoFileStream, VideoOptions};
use framestack::view::View;
use framestack::viewport::Viewport;
use framestack::webrtc::{sdp, WebRtcLayerSpec};
use framestack::EngineConfig;

/// Synthetic 30 fps decoder; frame n is filled with `n % 256`.
struct SyntheticDecoder {
    width: u32,
    height: u32,
}

impl VideoDecoder for SyntheticDecoder {
    fn fps(&self) -> f64 {
        30.0
    }
    fn frame_count(&self) -> u64 {
        30 * 60
    }
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn decode_frame(&mut self, index: u64) -> Result<Frame> {
        let data = vec![(index % 256) as u8; (self.width * self.height * 3) as usize];
        Frame::new(data, self.width, self.height, PixelFormat::Rgb8)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn synthetic_video() -> Arc<VideoFileStream> {
    Arc::new(VideoFileStream::new(
        "synthetic.mp4",
        Box::new(SyntheticDecoder {
            width: 480,
            height: 270,
        }),
        VideoOptions {
            looping: true,
            ..Default::default()
        },
    ))
}

#[derive(Default)]
struct RecordingSink {
    commands: Mutex<Vec<ClientCommand>>,
}

impl ClientSink for RecordingSink {
    fn send(&self, command: ClientCommand) {
        self.commands.lock().push(command);
    }
}

impl RecordingSink {
    fn updates_for(&self, layer_id: &str) -> Vec<(String, Value)> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                ClientCommand::UpdateLayer {
                    layer_id: id,
                    data,
                    metadata,
                } if id == layer_id => Some((data.clone(), metadata.clone())),
                _ => None,
            })
            .collect()
    }

    fn webrtc_setups(&self) -> Vec<(String, String)> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                ClientCommand::SetupWebRtcLayer {
                    layer_id, offer, ..
                } => Some((layer_id.clone(), offer.sdp.clone())),
                _ => None,
            })
            .collect()
    }
}

/// A playing 30 fps video layer delivers frames with monotone capture
/// times, resized to the display target, without ever exceeding the buffer
/// bound.
#[tokio::test(flavor = "multi_thread")]
async fn pull_delivery_end_to_end() {
    init_tracing();
    let sink = Arc::new(RecordingSink::default());
    let view = View::new(EngineConfig::with_size(320, 180), sink.clone());

    let video = synthetic_video();
    let layer = view
        .add_layer(LayerSpec {
            stream: Some(video),
            target_fps: 30,
            buffer_size: 4,
            jpeg_quality: 85,
            ..LayerSpec::default()
        })
        .unwrap();

    view.start();
    sleep(Duration::from_millis(1000)).await;

    for _ in 0..30 {
        view.dispatch(ClientEvent::FrameRequest {
            layer_id: layer.id().to_owned(),
        });
        sleep(Duration::from_millis(33)).await;
    }
    sleep(Duration::from_millis(200)).await;

    let updates = sink.updates_for(layer.id());
    // Buffered deliveries carry buffer occupancy; one-off fallback frames
    // (buffer misses) do not and are exercised elsewhere.
    let buffered: Vec<&(String, Value)> = updates
        .iter()
        .filter(|(_, metadata)| metadata.get("buffer_length").is_some())
        .collect();
    assert!(
        buffered.len() >= 25,
        "expected at least 25 buffered deliveries, got {} of {}",
        buffered.len(),
        updates.len()
    );

    let mut last_capture = f64::MIN;
    for (data, metadata) in &buffered {
        assert!(data.starts_with("data:image/jpeg;base64,"));
        let capture = metadata["capture_time"].as_f64().unwrap();
        assert!(capture >= last_capture, "capture times must be monotone");
        last_capture = capture;
        assert_eq!(metadata["frame_width"], 320);
        assert_eq!(metadata["frame_height"], 180);
        assert!(metadata["buffer_length"].as_u64().unwrap() <= 4);
        // Pipeline stage ordering holds for every frame.
        let encode_start = metadata["encode_start"].as_f64().unwrap();
        let encode_end = metadata["encode_end"].as_f64().unwrap();
        let send_time = metadata["send_time"].as_f64().unwrap();
        assert!(capture <= encode_start);
        assert!(encode_start <= encode_end);
        assert!(encode_end <= send_time);
    }

    view.stop();
    let delivered = sink.updates_for(layer.id()).len();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.updates_for(layer.id()).len(), delivered);
    view.shutdown();
}

/// Zooming while the video is paused refreshes the client from the last
/// frame: exactly one emission, carrying a nav thumbnail and target-size
/// dimensions.
#[tokio::test(flavor = "multi_thread")]
async fn paused_zoom_refresh() {
    init_tracing();
    let sink = Arc::new(RecordingSink::default());
    let view = View::new(EngineConfig::with_size(320, 180), sink.clone());

    let video = synthetic_video();
    let layer = view
        .add_layer(LayerSpec {
            stream: Some(Arc::clone(&video) as Arc<dyn FrameSource>),
            target_fps: 30,
            buffer_size: 4,
            ..LayerSpec::default()
        })
        .unwrap();

    video.start();
    video.get_frame(0.0);
    video.pause();

    view.dispatch(ClientEvent::ViewportChange(Viewport::new(
        0.25, 0.25, 0.5, 0.5, 2.0,
    )));
    view.dispatch(ClientEvent::FrameRequest {
        layer_id: layer.id().to_owned(),
    });
    sleep(Duration::from_millis(100)).await;

    let updates = sink.updates_for(layer.id());
    assert_eq!(updates.len(), 1);
    let metadata = &updates[0].1;
    let thumbnail = metadata["nav_thumbnail"].as_str().unwrap();
    assert!(!thumbnail.is_empty());
    assert_eq!(metadata["frame_width"], 320);
    assert_eq!(metadata["frame_height"], 180);
    view.shutdown();
}

/// A derived layer gets exactly one injected frame per source frame, with
/// its own step timings and the source capture time; removal de-registers
/// the callback.
#[tokio::test(flavor = "multi_thread")]
async fn derived_layer_lifecycle() {
    init_tracing();
    let sink = Arc::new(RecordingSink::default());
    let view = View::new(EngineConfig::with_size(480, 270), sink.clone());

    let video = synthetic_video();
    let parent = view
        .add_layer(LayerSpec {
            stream: Some(Arc::clone(&video) as Arc<dyn FrameSource>),
            target_fps: 30,
            ..LayerSpec::default()
        })
        .unwrap();
    let derived = view
        .add_layer(LayerSpec {
            source_layer: Some(parent.id().to_owned()),
            x: Some(40),
            y: Some(20),
            width: Some(64),
            height: Some(64),
            overscan: 8,
            ..LayerSpec::default()
        })
        .unwrap();

    video.start();
    let (frame, _) = video.get_frame(0.0);
    assert!(frame.is_some());

    assert_eq!(derived.buffer_len(), 1);
    let buffered = derived.get_buffered_frame().unwrap();
    let expected_capture = video.last_frame_timestamp() * 1000.0;
    assert!((buffered.metadata.capture_time - expected_capture).abs() < 1e-6);
    assert!(buffered
        .metadata
        .filter_timings
        .iter()
        .any(|t| t.name == "Crop"));
    // Overscan layers carry the anchor in effect at capture time.
    assert_eq!(buffered.metadata.anchor_x, Some(40));
    assert_eq!(buffered.metadata.anchor_y, Some(20));

    view.remove_layer(derived.id());
    video.get_frame(0.5);
    video.get_frame(1.0);
    assert_eq!(derived.buffer_len(), 0);
    view.shutdown();
}

/// The bitrate rewrite hits the video section exactly as specified and
/// leaves the audio section byte-for-byte unchanged.
#[test]
fn sdp_bitrate_rewrite_contract() {
    let offer = [
        "v=0",
        "o=- 123456 2 IN IP4 127.0.0.1",
        "s=-",
        "t=0 0",
        "a=group:BUNDLE 0 1",
        "m=video 9 UDP/TLS/RTP/SAVPF 96",
        "c=IN IP4 0.0.0.0",
        "a=rtpmap:96 H264/90000",
        "a=fmtp:96 level-asymmetry-allowed=1",
        "m=audio 9 UDP/TLS/RTP/SAVPF 111",
        "c=IN IP4 0.0.0.0",
        "a=rtpmap:111 opus/48000/2",
        "a=fmtp:111 minptime=10",
    ]
    .join("\r\n");

    let shaped = sdp::apply_bitrate(&offer, 5_000_000);

    assert!(shaped.contains("b=AS:5000"));
    assert!(shaped.contains("b=TIAS:5000000"));
    let fmtp = shaped
        .split("\r\n")
        .find(|l| l.starts_with("a=fmtp:96"))
        .unwrap();
    assert!(fmtp.contains("x-google-max-bitrate=5000"));
    assert!(fmtp.contains("x-google-min-bitrate=2500"));
    assert!(fmtp.contains("x-google-start-bitrate=5000"));

    let audio_original = &offer[offer.find("m=audio").unwrap()..];
    let audio_shaped = &shaped[shaped.find("m=audio").unwrap()..];
    assert_eq!(audio_original, audio_shaped);
}

/// Buffer-bound injection law: a size-2 buffer fed five frames retains the
/// two most recent.
#[test]
fn piggyback_injection_overflow() {
    let layer = framestack::Layer::new(LayerSpec {
        piggyback: true,
        buffer_size: 2,
        ..LayerSpec::default()
    })
    .unwrap();

    for i in 0..5 {
        layer.inject_frame(
            format!("data:image/jpeg;base64,f{i}"),
            i as f64 * 0.1,
            None,
            None,
        );
    }

    let first = layer.get_buffered_frame().unwrap();
    let second = layer.get_buffered_frame().unwrap();
    assert!(layer.get_buffered_frame().is_none());
    assert!(first.data.ends_with("f3"));
    assert!(second.data.ends_with("f4"));
}

/// Full WebRTC setup path: layer registration, deferred start on
/// component-ready, offer generation on the manager runtime, and dispatch
/// of the bitrate-shaped offer by the periodic tick.
#[tokio::test(flavor = "multi_thread")]
async fn webrtc_offer_reaches_client() {
    init_tracing();
    let sink = Arc::new(RecordingSink::default());
    let view = View::new(EngineConfig::with_size(320, 180), sink.clone());

    let video = synthetic_video();
    let mut spec = WebRtcLayerSpec::new(video as Arc<dyn FrameSource>);
    spec.bitrate = 3_000_000;
    spec.name = "main-video".into();
    let layer_id = view.add_webrtc_layer(spec).unwrap();

    view.dispatch(ClientEvent::ComponentReady);

    let mut setups = Vec::new();
    for _ in 0..300 {
        setups = sink.webrtc_setups();
        if !setups.is_empty() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(!setups.is_empty(), "no webrtc offer reached the client");
    let (id, offer_sdp) = &setups[0];
    assert_eq!(id, &layer_id);
    assert!(offer_sdp.contains("b=AS:3000"));
    assert!(offer_sdp.contains("b=TIAS:3000000"));
    assert!(offer_sdp.contains("x-google-max-bitrate=3000"));

    view.remove_webrtc_layer(&layer_id);
    view.shutdown();
}

/// SVG overlay plumbing: placeholders resolve and updates reach the client.
#[tokio::test(flavor = "multi_thread")]
async fn svg_overlay_round_trip() {
    let sink = Arc::new(RecordingSink::default());
    let view = View::new(EngineConfig::with_size(320, 180), sink.clone());

    view.set_svg(
        "<circle cx=\"{x}\" cy=\"{y}\" r=\"10\" fill=\"red\"/>",
        HashMap::from([
            ("x".to_owned(), "0".to_owned()),
            ("y".to_owned(), "0".to_owned()),
        ]),
    );
    view.update_svg_values([("x".to_owned(), "42".to_owned())]);

    let commands = sink.commands.lock();
    let svgs: Vec<&str> = commands
        .iter()
        .filter_map(|c| match c {
            ClientCommand::UpdateSvg { svg } => Some(svg.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(svgs.len(), 2);
    assert!(svgs[1].contains("cx=\"42\""));
    drop(commands);
    view.shutdown();
}

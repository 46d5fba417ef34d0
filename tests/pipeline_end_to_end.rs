use std::time::{Duration, Instant};

use dualcam_tracker::config::{PipelineConfig, SourceConfig, SourcesConfig};
use dualcam_tracker::ingest::{Capture, SyntheticCapture};
use dualcam_tracker::{Frame, SourceId, SourceRegistry, TrackingOrchestrator};

fn config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.capture.width = 320;
    cfg.capture.height = 240;
    cfg.capture.fps = 0;
    cfg
}

fn next_frame(capture: &mut SyntheticCapture, sequence: u64) -> Frame {
    Frame::new(capture.read().expect("synthetic frame"), sequence)
}

#[test]
fn synthetic_pair_is_tracked_and_triangulated() {
    let cfg = config();
    let mut orchestrator = TrackingOrchestrator::from_config(&cfg).expect("orchestrator");
    let mut left = SyntheticCapture::new(&cfg.capture, 0);
    let mut right = SyntheticCapture::new(&cfg.capture, 40);

    let mut identities = Vec::new();
    for cycle in 1..=10u64 {
        let f1 = next_frame(&mut left, cycle);
        let f2 = next_frame(&mut right, cycle);
        let out = orchestrator.process_cycle(Some(&f1), Some(&f2));
        assert!(out.failures.is_empty());

        if cycle < 3 {
            assert!(out.source1.is_empty(), "tracks confirm on the third hit");
            assert!(out.source2.is_empty());
            continue;
        }
        assert_eq!(out.source1.len(), 1);
        assert_eq!(out.source2.len(), 1);

        let a = &out.source1[0];
        let b = &out.source2[0];
        assert_eq!(a.class_name, "car");
        assert_eq!(a.source, SourceId::Source1);
        assert_eq!(b.source, SourceId::Source2);
        identities.push((a.identity.unwrap(), b.identity.unwrap()));

        // 40 px disparity on a 320 px frame with a 0.5 m baseline.
        let pa = a.position.expect("source1 position");
        let pb = b.position.expect("source2 position");
        assert!((pa.z - 2.0).abs() < 0.05, "depth was {}", pa.z);
        assert_eq!(pa, pb);
    }

    identities.dedup();
    assert_eq!(identities.len(), 1, "identity changed between cycles");
    let (id1, _) = identities[0];
    let trail = orchestrator
        .track_history(SourceId::Source1, id1)
        .expect("history for tracked object");
    assert_eq!(trail.samples.len(), 8);
}

#[test]
fn single_source_falls_back_to_monocular_depth() {
    let cfg = config();
    let mut orchestrator = TrackingOrchestrator::from_config(&cfg).expect("orchestrator");
    let mut left = SyntheticCapture::new(&cfg.capture, 0);

    let mut last = None;
    for cycle in 1..=4u64 {
        let f1 = next_frame(&mut left, cycle);
        last = Some(orchestrator.process_cycle(Some(&f1), None));
    }
    let out = last.unwrap();
    assert!(out.source2.is_empty());
    let position = out.source1[0].position.expect("monocular position");
    let geometry = &cfg.geometry;
    assert!(position.z >= geometry.min_depth_m && position.z <= geometry.max_depth_m);
    assert!(position.is_finite());
}

#[test]
fn live_registry_feeds_the_orchestrator() {
    let mut cfg = config();
    cfg.capture.fps = 60;
    cfg.sources = SourcesConfig {
        source1: SourceConfig::url("stub://left", "Left"),
        source2: SourceConfig::url("stub://right?shift=40", "Right"),
    };
    let mut orchestrator = TrackingOrchestrator::from_config(&cfg).expect("orchestrator");
    let mut registry = SourceRegistry::new();
    registry
        .initialize(&cfg.sources, &cfg.capture)
        .expect("synthetic sources start");

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut tracked = false;
    while Instant::now() < deadline {
        let frames = registry.get_frames();
        let out = orchestrator.process_cycle(frames.source1.as_ref(), frames.source2.as_ref());
        if !out.source1.is_empty() && !out.source2.is_empty() {
            assert!(out
                .source1
                .iter()
                .chain(&out.source2)
                .all(|o| o.identity.is_some() && o.position.is_some()));
            tracked = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(15));
    }
    assert!(tracked, "no confirmed objects from synthetic sources");

    let info = registry.get_source_info();
    assert!(info.values().all(|i| i.running && i.frames_captured > 0));
    registry.stop_all();
    assert!(registry.get_frames().is_empty());
}

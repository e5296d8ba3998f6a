use habtracker::alert::Annunciator;
use habtracker::camera::{CalibrationPolicy, CameraBringup, CameraResource};
use habtracker::command::{CommandInterpreter, CommandTiming};
use habtracker::downlink::{Downlink, EnqueuePolicy, TxQueue};
use habtracker::sim::{CameraControl, SimAlert, SimCamera};
use habtracker::state::{Configuration, FrameSize, PacketType, StateStore, StatusField};
use habtracker::supervisor::{RestartLine, RestartReason};
use habtracker::PayloadError;
use std::time::Duration;

struct Bench {
    interpreter: CommandInterpreter,
    queue: TxQueue,
    state: StateStore,
    camera: CameraControl,
    restart: RestartLine,
}

fn bench() -> Bench {
    let state = StateStore::new();
    let queue = TxQueue::new(EnqueuePolicy::default());
    let downlink = Downlink::new(queue.clone());
    let (alert, _) = SimAlert::new();
    let annunciator = Annunciator::new(Box::new(alert), state.clone());
    let (camera, control) = SimCamera::new();
    let bringup = CameraBringup::new(downlink.clone(), annunciator, CalibrationPolicy::default());
    let restart = RestartLine::new();
    let interpreter = CommandInterpreter::new(
        state.clone(),
        downlink,
        CameraResource::new(Box::new(camera)),
        bringup,
        restart.clone(),
        CommandTiming::default(),
    );

    Bench {
        interpreter,
        queue,
        state,
        camera: control,
        restart,
    }
}

/// Everything the interpreter queued, as ground-side text.
async fn replies(queue: &TxQueue) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(packet) = queue.dequeue(Duration::from_millis(5)).await {
        lines.push(String::from_utf8_lossy(packet.as_bytes()).into_owned());
    }
    lines
}

fn framed(codes: &[&str]) -> Vec<String> {
    codes.iter().map(|code| format!("** Code: {} **", code)).collect()
}

const CAMERA_BRINGUP_OK: [&str; 4] = ["0x2000", "0x2001", "0x2003", "0x2004"];

#[tokio::test(start_paused = true)]
async fn test_set_rejected_while_transmitting() {
    let bench = bench();

    let permit = bench.state.begin_transmission();
    bench.interpreter.execute("SET,SSDV_CYCLE,30").await.unwrap();
    assert_eq!(replies(&bench.queue).await, framed(&["0x5007"]));
    assert_eq!(bench.state.get_config().ssdv_cycle_secs, 60);

    permit.release();
    bench.interpreter.execute("SET,SSDV_CYCLE,30").await.unwrap();
    assert_eq!(replies(&bench.queue).await, framed(&["0x5012, Info: 30"]));
    assert_eq!(bench.state.get_config().ssdv_cycle_secs, 30);
}

#[tokio::test(start_paused = true)]
async fn test_ssdv_quality_bounds() {
    let bench = bench();

    bench.interpreter.execute("SET,SSDV_QUALITY,5").await.unwrap();
    bench.interpreter.execute("SET,SSDV_QUALITY,9").await.unwrap();
    bench.interpreter.execute("SET,SSDV_QUALITY,high").await.unwrap();

    assert_eq!(
        replies(&bench.queue).await,
        framed(&["0x5011, Info: 5", "0x500A", "0x500A"])
    );
    assert_eq!(bench.state.get_config().ssdv_quality, 5);
}

#[tokio::test(start_paused = true)]
async fn test_get_reports_current_values() {
    let bench = bench();
    bench.state.set_status_field(StatusField::RelayEnabled, false);

    bench.interpreter.execute("GET,RELAY").await.unwrap();
    bench.interpreter.execute("GET,SSDV").await.unwrap();
    bench.interpreter.execute("GET,CAM").await.unwrap();

    assert_eq!(
        replies(&bench.queue).await,
        framed(&[
            "0x5100, Info: 0",
            "0x5101, Info: 1",
            "0x5104, Info: 60",
            "0x5102, Info: 1",
            "0x5103, Info: 2",
            "0x5105, Info: 8",
            "0x5106, Info: 5",
        ])
    );
}

#[tokio::test(start_paused = true)]
async fn test_ctl_toggles_status() {
    let bench = bench();

    bench.interpreter.execute("CTL,RELAY,OFF").await.unwrap();
    bench.interpreter.execute("CTL,SSDV,OFF").await.unwrap();
    assert!(!bench.state.get_status().relay_enabled);
    assert!(!bench.state.get_status().ssdv_enabled);

    bench.interpreter.execute("CTL,SSDV,ON").await.unwrap();
    bench.interpreter.execute("CTL,RELAY,MAYBE").await.unwrap();
    assert!(bench.state.get_status().ssdv_enabled);

    assert_eq!(
        replies(&bench.queue).await,
        framed(&["0x500D", "0x500F", "0x500E", "0x5005"])
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_commands_are_nacked() {
    let bench = bench();

    for line in ["GET", "SET,CAM_SIZE", "RUN,CAM,1", "GET,FOO", "CTL,FOO,ON", "SET,FOO,1", "SET,SSDV_TYPE,TURBO"] {
        bench.interpreter.execute(line).await.unwrap();
    }

    assert_eq!(
        replies(&bench.queue).await,
        framed(&["0x5001", "0x5002", "0x5003", "0x5004", "0x5005", "0x5006", "0x5003"])
    );
    assert_eq!(bench.state.get_config(), Configuration::default());
}

#[tokio::test(start_paused = true)]
async fn test_camera_resize_reinitialises_driver() {
    let bench = bench();

    bench.interpreter.execute("SET,CAM_SIZE,XGA").await.unwrap();

    let mut expected = vec!["0x5013, Info: 10"];
    expected.extend(CAMERA_BRINGUP_OK);
    expected.push("0x2007");
    assert_eq!(replies(&bench.queue).await, framed(&expected));

    assert_eq!(bench.state.get_config().camera_size, FrameSize::Xga);
    let active = bench.camera.active_config().unwrap();
    assert_eq!(active.camera_size, FrameSize::Xga);
    assert_eq!(bench.camera.counters().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_large_frame_requires_higher_quality() {
    let bench = bench();
    bench.interpreter.execute("SET,CAM_SIZE,XGA").await.unwrap();
    replies(&bench.queue).await;

    bench.interpreter.execute("SET,CAM_QUALITY,6").await.unwrap();
    assert_eq!(replies(&bench.queue).await, framed(&["0x5009"]));
    assert_eq!(bench.state.get_config().camera_quality, 5);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconfiguration_rolls_back_camera_fields() {
    let bench = bench();
    bench.interpreter.execute("SET,SSDV_CYCLE,45").await.unwrap();
    bench.interpreter.execute("SET,SSDV_TYPE,NORMAL").await.unwrap();
    replies(&bench.queue).await;

    bench.camera.fail_inits(1);
    bench.interpreter.execute("SET,CAM_QUALITY,12").await.unwrap();

    let mut expected = vec!["0x5014, Info: 12", "0x2000", "0x2002, Info: 261", "0x2008"];
    expected.extend(CAMERA_BRINGUP_OK);
    expected.push("0x2009");
    assert_eq!(replies(&bench.queue).await, framed(&expected));

    let config = bench.state.get_config();
    assert_eq!(config.camera_size, FrameSize::Vga);
    assert_eq!(config.camera_quality, 5);
    assert_eq!(config.ssdv_cycle_secs, 45);
    assert_eq!(config.ssdv_type, PacketType::Normal);
    assert!(bench.restart.requested().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_rollback_restarts() {
    let bench = bench();
    bench.camera.fail_inits(2);

    let result = bench.interpreter.execute("SET,CAM_SIZE,FHD").await;
    assert!(matches!(
        result,
        Err(PayloadError::Restart(RestartReason::ReconfigurationFailed))
    ));
    assert_eq!(bench.restart.requested(), Some(RestartReason::ReconfigurationFailed));

    let sent = replies(&bench.queue).await;
    assert_eq!(
        sent,
        framed(&[
            "0x5013, Info: 14",
            "0x2000",
            "0x2002, Info: 261",
            "0x2008",
            "0x2000",
            "0x2002, Info: 261",
            "0x200A",
            "0x1003",
        ])
    );
}

#[tokio::test(start_paused = true)]
async fn test_reboot_command() {
    let bench = bench();
    let result = bench.interpreter.execute("CTL,SYS,REBOOT").await;

    assert_eq!(result.unwrap_err().restart_reason(), Some(RestartReason::OperatorCommand));
    assert_eq!(bench.restart.requested(), Some(RestartReason::OperatorCommand));
    assert_eq!(replies(&bench.queue).await, framed(&["0x1003"]));
}

#[test]
fn test_concurrent_config_reads_are_never_torn() {
    let store = StateStore::new();
    let a = Configuration::default();
    let b = Configuration {
        camera_size: FrameSize::Fhd,
        camera_quality: 20,
        ssdv_type: PacketType::Normal,
        ssdv_quality: 6,
        ssdv_cycle_secs: 100,
    };

    let writer = {
        let store = store.clone();
        std::thread::spawn(move || {
            for i in 0..10_000 {
                store.replace_config(if i % 2 == 0 { b } else { a });
            }
        })
    };

    for _ in 0..10_000 {
        let seen = store.get_config();
        assert!(seen == a || seen == b, "torn read: {:?}", seen);
    }
    writer.join().unwrap();
}

use habtracker::hal::{Fix, GpsTime};
use habtracker::payload::{Hardware, ImageExecution, Payload};
use habtracker::settings::PayloadSettings;
use habtracker::sim::*;
use habtracker::supervisor::RestartReason;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

struct Ground {
    radio: RadioControl,
    camera: CameraControl,
    gps: GpsControl,
    alerts: AlertLog,
}

fn hardware() -> (Hardware, Ground) {
    let (radio, radio_control) = SimRadio::new();
    let (camera, camera_control) = SimCamera::new();
    let (gps, gps_control) = SimGps::new();
    let (alert, alerts) = SimAlert::new();

    let hardware = Hardware {
        radio: Box::new(radio),
        camera: Box::new(camera),
        codec: Box::new(ChunkCodec::new()),
        gps: Box::new(gps),
        voltage: Box::new(SimVoltage::new(430)),
        temperature: Box::new(SimTemperature::new(18.0)),
        alert: Box::new(alert),
    };
    let ground = Ground {
        radio: radio_control,
        camera: camera_control,
        gps: gps_control,
        alerts,
    };
    (hardware, ground)
}

fn payload(debug_mode: bool) -> Payload {
    let settings = PayloadSettings {
        debug_mode,
        ..PayloadSettings::default()
    };
    Payload::new(settings).with_image_execution(ImageExecution::SameRuntime)
}

/// Run the payload alongside `ground`, which never finishes on its own.
async fn fly<G>(payload: Payload, hardware: Hardware, ground: G) -> RestartReason
where
    G: Future<Output = ()>,
{
    tokio::select! {
        result = payload.run(hardware) => result.unwrap(),
        _ = async {
            ground.await;
            std::future::pending::<()>().await
        } => unreachable!(),
    }
}

fn reported(text: &[String], code: &str) -> bool {
    text.iter().any(|line| line == &format!("** Code: {} **", code))
}

fn fix() -> Fix {
    Fix {
        time: GpsTime {
            year: 2024,
            month: 5,
            day: 1,
            hour: 9,
            minute: 0,
            second: 0,
        },
        latitude: 39.9,
        longitude: 116.4,
        altitude_m: 120.0,
        speed_kmh: 3.0,
        satellites: 7,
        heading_deg: 90.0,
        location_valid: true,
    }
}

#[tokio::test(start_paused = true)]
async fn test_developer_boot_then_operator_reboot() {
    let (hardware, ground) = hardware();
    let radio = ground.radio.clone();

    let reason = fly(payload(true), hardware, async {
        sleep(Duration::from_secs(30)).await;
        radio.inject_line("@@CTL,SYS,REBOOT");
    })
    .await;
    assert_eq!(reason, RestartReason::OperatorCommand);

    let text = ground.radio.take_text();
    for code in ["0x1000", "0x2000", "0x2001", "0x2003", "0x2004", "0x3000", "0x3001", "0x1004", "0x1001", "0x1003"] {
        assert!(reported(&text, code), "missing {}", code);
    }
    assert!(text.iter().any(|line| line.starts_with("** $$BG7ZDQ,0,DEBUG_MODE,")));
    assert!(reported(&text, "0x4000, Info: 0"));
    // One ready beep, no error beeps.
    assert_eq!(ground.alerts.activations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_flight_boot_downlinks_images_and_answers_commands() {
    let (hardware, ground) = hardware();
    ground.gps.publish(fix());
    let radio = ground.radio.clone();

    let reason = fly(payload(false), hardware, async {
        sleep(Duration::from_secs(40)).await;
        radio.inject_line("@@GET,CAM");
        sleep(Duration::from_secs(5)).await;
        radio.inject_line("@@CTL,SYS,REBOOT");
    })
    .await;
    assert_eq!(reason, RestartReason::OperatorCommand);

    let written = ground.radio.take_written();
    let text: Vec<String> = written
        .iter()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .collect();
    assert!(reported(&text, "0x3001"));
    assert!(reported(&text, "0x4001, Info: 0"));
    assert!(reported(&text, "0x5105, Info: 8"));
    assert!(reported(&text, "0x5106, Info: 5"));
    assert!(text.iter().any(|line| line.starts_with("** $$BG7ZDQ,0,2024-05-01T09:00:00Z,")));
    assert!(written.iter().any(|bytes| bytes.len() == 256 && bytes[0] == CHUNK_SYNC));
}

#[tokio::test(start_paused = true)]
async fn test_camera_failure_fails_boot_check() {
    let (hardware, ground) = hardware();
    ground.camera.fail_inits(1);

    let reason = payload(true).run(hardware).await.unwrap();
    assert_eq!(reason, RestartReason::BootCheckFailed);

    let text = ground.radio.take_text();
    assert!(reported(&text, "0x2002, Info: 261"));
    assert!(reported(&text, "0x2005"));
    assert!(reported(&text, "0x1002"));
    assert!(!reported(&text, "0x1001"));
    // Three error beeps, then the long failure tone.
    assert_eq!(ground.alerts.activations(), 4);
    assert!(!ground.alerts.is_on());
}

#[tokio::test(start_paused = true)]
async fn test_positioning_timeout_fails_boot_check() {
    let (hardware, ground) = hardware();

    let reason = payload(false).run(hardware).await.unwrap();
    assert_eq!(reason, RestartReason::BootCheckFailed);

    let text = ground.radio.take_text();
    assert!(reported(&text, "0x3000"));
    assert!(reported(&text, "0x3002, Info: Timeout"));
    assert!(reported(&text, "0x1002"));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_settings_refuse_to_boot() {
    let (hardware, _ground) = hardware();
    let settings = PayloadSettings {
        callsign: String::new(),
        ..PayloadSettings::default()
    };

    let result = Payload::new(settings).run(hardware).await;
    assert!(matches!(result, Err(habtracker::PayloadError::Settings(_))));
}

#[tokio::test(start_paused = true)]
async fn test_zero_telemetry_period_refuses_to_boot() {
    let (hardware, ground) = hardware();
    let settings = PayloadSettings::from_json(r#"{"debug_mode":true,"telemetry_period_ms":0}"#);
    assert!(settings.is_err());

    let settings = PayloadSettings {
        debug_mode: true,
        telemetry_period_ms: 0,
        ..PayloadSettings::default()
    };
    let result = Payload::new(settings).run(hardware).await;
    assert!(matches!(result, Err(habtracker::PayloadError::Settings(_))));
    assert!(ground.radio.take_text().is_empty());
}

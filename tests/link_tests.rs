use habtracker::alert::Annunciator;
use habtracker::camera::{CalibrationPolicy, CameraBringup, CameraResource};
use habtracker::command::{CommandInterpreter, CommandTiming};
use habtracker::datalink::{inbound_queues, InboundLine, LinkMultiplexer, LinkTiming};
use habtracker::downlink::{Downlink, EnqueuePolicy, OutboundPacket, Priority, TxQueue};
use habtracker::relay::{RelayForwarder, RelayTiming};
use habtracker::sim::{RadioControl, SimAlert, SimCamera, SimRadio};
use habtracker::state::{Configuration, StateStore, StatusField};
use habtracker::supervisor::{RestartLine, Watchdog};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

struct Link {
    mux: LinkMultiplexer,
    radio: RadioControl,
    queue: TxQueue,
    state: StateStore,
    commands: mpsc::Receiver<InboundLine>,
    relay: mpsc::Receiver<InboundLine>,
}

fn link() -> Link {
    let (radio, control) = SimRadio::new();
    let queue = TxQueue::new(EnqueuePolicy::default());
    let state = StateStore::new();
    let ((command_tx, command_rx), (relay_tx, relay_rx)) = inbound_queues();
    let mux = LinkMultiplexer::new(
        Box::new(radio),
        queue.clone(),
        state.clone(),
        command_tx,
        relay_tx,
        LinkTiming::default(),
    );

    Link {
        mux,
        radio: control,
        queue,
        state,
        commands: command_rx,
        relay: relay_rx,
    }
}

#[tokio::test(start_paused = true)]
async fn test_command_lines_reach_the_interpreter_queue() {
    let mut link = link();
    link.radio.inject_line("@@GET,RELAY");
    link.radio.inject(b"@@CTL,SSDV,OFF\r\n");

    assert!(link.mux.run_once().await);
    assert_eq!(link.commands.try_recv().unwrap().as_str(), "GET,RELAY");
    assert_eq!(link.commands.try_recv().unwrap().as_str(), "CTL,SSDV,OFF");
    assert!(link.relay.try_recv().is_err());
    assert_eq!(link.mux.stats().commands_forwarded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_relay_lines_follow_status() {
    let mut link = link();

    link.radio.inject_line("##HELLO");
    link.mux.run_once().await;
    assert_eq!(link.relay.try_recv().unwrap().as_str(), "HELLO");

    link.state.set_status_field(StatusField::RelayEnabled, false);
    link.radio.inject_line("##HELLO");
    link.mux.run_once().await;
    assert!(link.relay.try_recv().is_err());

    link.state.set_status_field(StatusField::RelayEnabled, true);
    let permit = link.state.begin_transmission();
    link.radio.inject_line("##HELLO");
    link.mux.run_once().await;
    assert!(link.relay.try_recv().is_err());
    drop(permit);

    assert_eq!(link.mux.stats().relays_forwarded, 1);
    assert_eq!(link.mux.stats().relays_suppressed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_overlong_line_is_discarded() {
    let mut link = link();
    link.radio.inject(&[b'A'; 600]);
    link.radio.inject(b"\n@@GET,CAM\n");
    link.radio.inject_line("junk");
    link.radio.inject_line("@@");

    link.mux.run_once().await;
    assert_eq!(link.commands.try_recv().unwrap().as_str(), "GET,CAM");
    assert!(link.commands.try_recv().is_err());
    // The tail of the overlong line and the unprefixed line.
    assert_eq!(link.mux.stats().lines_dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_non_utf8_line_is_counted_as_dropped() {
    let mut link = link();
    link.radio.inject(b"@@GET,\xC3\x28\n");
    link.radio.inject_line("@@GET,RELAY");

    link.mux.run_once().await;
    assert_eq!(link.commands.try_recv().unwrap().as_str(), "GET,RELAY");
    assert!(link.commands.try_recv().is_err());
    assert_eq!(link.mux.stats().lines_dropped, 1);
    assert_eq!(link.mux.stats().lines_received, 2);
}

#[tokio::test(start_paused = true)]
async fn test_one_transmit_per_iteration() {
    let mut link = link();
    for name in ["a", "b", "c"] {
        link.queue.enqueue(OutboundPacket::text(name), Priority::High).await.unwrap();
    }

    link.mux.run_once().await;
    assert_eq!(link.radio.take_text(), vec!["** a **".to_string()]);
    link.mux.run_once().await;
    link.mux.run_once().await;
    assert_eq!(link.radio.take_text(), vec!["** b **".to_string(), "** c **".to_string()]);
    assert!(!link.mux.run_once().await);
    assert_eq!(link.queue.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_loses_only_that_packet() {
    let mut link = link();
    link.queue.enqueue(OutboundPacket::text("lost"), Priority::High).await.unwrap();
    link.queue.enqueue(OutboundPacket::text("kept"), Priority::High).await.unwrap();

    link.radio.fail_writes(true);
    link.mux.run_once().await;
    link.radio.fail_writes(false);
    link.mux.run_once().await;

    assert_eq!(link.radio.take_text(), vec!["** kept **".to_string()]);
    assert_eq!(link.mux.stats().write_errors, 1);
    assert_eq!(link.mux.stats().packets_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_round_trip_over_the_air() {
    let link = link();
    let watchdog = Watchdog::new(Duration::from_secs(120));
    let downlink = Downlink::new(link.queue.clone());
    let forwarder = RelayForwarder::new(link.state.clone(), downlink, RelayTiming::default());

    let link_handle = watchdog.register("link").unwrap();
    let relay_handle = watchdog.register("relay").unwrap();
    let radio = link.radio.clone();
    tokio::spawn(link.mux.run(link_handle));
    tokio::spawn(forwarder.run(link.relay, relay_handle));

    radio.inject_line("##HELLO");
    sleep(Duration::from_millis(200)).await;
    assert_eq!(radio.take_text(), vec!["** ##RELAY,HELLO **".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_relay_rate_limit_per_window() {
    let state = StateStore::new();
    let queue = TxQueue::new(EnqueuePolicy::default());
    let forwarder = RelayForwarder::new(state, Downlink::new(queue.clone()), RelayTiming::default());
    let (relay_tx, relay_rx) = mpsc::channel(10);
    let watchdog = Watchdog::new(Duration::from_secs(600));
    tokio::spawn(forwarder.run(relay_rx, watchdog.register("relay").unwrap()));

    for i in 0..85 {
        let line = InboundLine::from(&format!("CQ {}", i)).unwrap();
        relay_tx.send(line).await.unwrap();
    }
    sleep(Duration::from_millis(100)).await;

    let mut sent = Vec::new();
    while let Some(packet) = queue.dequeue(Duration::from_millis(5)).await {
        sent.push(String::from_utf8_lossy(packet.as_bytes()).into_owned());
    }
    assert_eq!(sent.len(), 81);
    assert_eq!(sent[0], "** ##RELAY,CQ 0 **");
    assert_eq!(sent[79], "** ##RELAY,CQ 79 **");
    assert_eq!(sent[80], "** Code: 0x1005 **");

    sleep(Duration::from_secs(121)).await;
    relay_tx.send(InboundLine::from("CQ again").unwrap()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    let packet = queue.dequeue(Duration::from_millis(5)).await.unwrap();
    assert_eq!(packet.as_bytes(), b"** ##RELAY,CQ again **");
}

fn interpreter(link: &Link) -> CommandInterpreter {
    let downlink = Downlink::new(link.queue.clone());
    let (alert, _) = SimAlert::new();
    let annunciator = Annunciator::new(Box::new(alert), link.state.clone());
    let (camera, _) = SimCamera::new();
    CommandInterpreter::new(
        link.state.clone(),
        downlink.clone(),
        CameraResource::new(Box::new(camera)),
        CameraBringup::new(downlink, annunciator, CalibrationPolicy::default()),
        RestartLine::new(),
        CommandTiming::default(),
    )
}

/// Uplink one line, hand whatever the link forwarded to the interpreter,
/// then let the link transmit the reply.
async fn uplink(link: &mut Link, interpreter: &CommandInterpreter, line: &str) -> Vec<String> {
    link.radio.inject_line(line);
    link.mux.run_once().await;
    let command = link.commands.try_recv().unwrap();
    interpreter.execute(&command).await.unwrap();
    link.mux.run_once().await;
    link.radio.take_text()
}

#[tokio::test(start_paused = true)]
async fn test_uplinked_setting_waits_for_idle_camera() {
    let mut link = link();
    let interpreter = interpreter(&link);
    let default_quality = Configuration::default().ssdv_quality;
    assert_ne!(default_quality, 6);

    let permit = link.state.begin_transmission();
    let busy = uplink(&mut link, &interpreter, "@@SET,SSDV_QUALITY,6").await;
    assert_eq!(busy, vec!["** Code: 0x5007 **".to_string()]);
    assert_eq!(link.state.get_config().ssdv_quality, default_quality);

    permit.release();
    let idle = uplink(&mut link, &interpreter, "@@SET,SSDV_QUALITY,6").await;
    assert_eq!(idle, vec!["** Code: 0x5011, Info: 6 **".to_string()]);
    assert_eq!(link.state.get_config().ssdv_quality, 6);
}

use std::time::{Duration, Instant};

use anyhow::Context;

use siglyzer_capture::{Analyzer, SessionState, UsbAnalyzer};
use siglyzer_trace::SharedTraceSet;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(vid), Some(pid)) = (args.next(), args.next()) else {
        println!("Usage: capture <vid-hex> <pid-hex> [seconds]");
        std::process::exit(1);
    };
    let vid = u16::from_str_radix(&vid, 16)?;
    let pid = u16::from_str_radix(&pid, 16)?;
    let seconds: u64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(2);

    let info = nusb::list_devices()?
        .find(|d| d.vendor_id() == vid && d.product_id() == pid)
        .context("no matching device attached")?;
    let (mut session, events) = UsbAnalyzer::open(&info, 0)?;
    println!("opened {vid:04x}:{pid:04x} {}", session.details());

    for (slot, input) in session.default_inputs().into_iter().enumerate() {
        let name = session.input_names()[&input];
        println!("channel {slot}: {name}");
        session.set_channel(slot, input);
    }

    let output = SharedTraceSet::new();
    session.start_trace(output.clone(), 1_000_000.0)?;

    let data_ready = session.data_ready();
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        if data_ready.recv_timeout(Duration::from_millis(100)).is_ok() {
            session.process_pending();
        }
        if let Ok(state) = events.try_recv() {
            println!("session state: {state:?}");
            if state == SessionState::Disconnected {
                anyhow::bail!("device lost during capture");
            }
        }
    }

    session.stop_trace()?;
    session.process_pending();

    let set = output.read();
    println!("captured {} trace(s)", set.trace_count());
    for entry in set.entries() {
        let trace = &entry.trace;
        println!(
            "channel {:2}: {:10} samples in {:6} blocks, {:.3}s..{:.3}s",
            entry.channel,
            trace.len(),
            trace.blocks.len(),
            trace.start_time(),
            trace.end_time(),
        );
    }

    Ok(())
}

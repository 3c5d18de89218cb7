use std::time::Duration;

use rbp_sensor_common::serial::LoopbackConnector;

const INTERVAL: Duration = Duration::from_secs(1);

/// Simulate the sensor board on `connector`: one reading per second while a connection
/// is open, an occasional garbled line, and whatever it receives echoed to the log.
pub fn spawn_demo_device(connector: LoopbackConnector) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("demo-device".into())
        .spawn(move || {
            let mut tick: u32 = 0;
            loop {
                if connector.live_connections() > 0 {
                    let phase = tick as f32 / 10.0;
                    let temperature = 24.0 + 5.0 * phase.sin();
                    let humidity = 55.0 + 8.0 * (phase / 2.0).cos();
                    connector.feed(format!("{temperature:.2},{humidity:.2}\n").as_bytes());

                    // DHT sensors report read errors in band.
                    if tick % 15 == 7 {
                        connector.feed(b"ERR,timeout\n");
                    }
                    tick = tick.wrapping_add(1);
                }

                let received = connector.take_written();
                if !received.is_empty() {
                    log::info!(
                        "Demo device received {:?}",
                        String::from_utf8_lossy(&received)
                    );
                }

                std::thread::sleep(INTERVAL);
            }
        })?;

    Ok(())
}

//! Upgrade a device over BLE from the command line:
//!
//!     cargo run --example upgrade -- firmware.bin [device-name-or-address]
//!
//! Without a target, the first device advertising an OTA upgrade service
//! is used. Set RUST_LOG=debug to watch the GATT traffic.

use wisp_ota::{DeviceQuirks, OtaConfig, OtaDevice, OtaUpgrader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: upgrade <firmware.bin> [device-name-or-address]")?;
    let target = args.next();
    let firmware = std::fs::read(&path)?;
    println!("image: {} ({} bytes)", path, firmware.len());

    let transport = wisp_ble::find_device(target.as_deref()).await?;
    let mut device = OtaDevice::Ble {
        transport: Box::new(transport),
        quirks: DeviceQuirks::default(),
    };
    println!("upgrading {}", device.name());

    let (upgrader, mut progress) = OtaUpgrader::new(OtaConfig::default());
    let reporter = tokio::spawn(async move {
        while let Some(update) = progress.recv().await {
            if update.is_error() {
                eprintln!("[{}] {}", update.state, update.description);
            } else if update.firmware_size > 0 {
                println!(
                    "[{}] {}/{} bytes",
                    update.state, update.transferred_size, update.firmware_size
                );
            } else {
                println!("[{}] {}", update.state, update.description);
            }
        }
    });

    let result = upgrader.upgrade(&mut device, firmware).await;
    drop(upgrader); // close the progress channel so the reporter ends
    let _ = reporter.await;

    result?;
    println!("upgrade complete");
    Ok(())
}

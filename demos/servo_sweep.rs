//! Sweep a hobby servo on GPIO 17 back and forth three times.
//!
//! The pulses are generated by DMA channel 5, paced by the PWM peripheral. Set `RUST_LOG=debug`
//! to follow the ring installations.

use rpio_pwm::{AccessError, Engine, Error, PacingSource};
use std::thread;
use std::time::Duration;

const SERVO_GPIO: u8 = 17;
const DMA_CHANNEL: u8 = 5;

fn main() {
    env_logger::init();

    // Map the peripherals of this host.
    let mut engine = match Engine::open() {
        Ok(e) => e,
        Err(Error::PeripheralAccess(kind)) => match kind {
            AccessError::PermissionDenied
                => panic!("You do not have permission to access /dev/mem: \
                           maybe you should run as root?"),
            AccessError::UnsupportedPlatform
                => panic!("This does not look like a supported Raspberry Pi."),
            kind => panic!("The peripherals could not be mapped: {:?}", kind),
        },
        Err(e) => panic!("{}", e),
    };

    // 20 ms cycle, 10 us resolution.
    engine.init_channel(DMA_CHANNEL, 20_000, 10, PacingSource::Pwm, false).unwrap();
    engine.add_gpio(DMA_CHANNEL, SERVO_GPIO, 1500).unwrap();

    for _ in 0..3 {
        for &width in [1000, 1250, 1500, 1750, 2000, 1750, 1500, 1250].iter() {
            engine.set_width(SERVO_GPIO, width).unwrap();
            println!("Pulse width {} us", width);
            thread::sleep(Duration::from_millis(300));
        }
    }

    // Leave the pin low and stop the DMA engine.
    engine.release_gpio(SERVO_GPIO);
    engine.shutdown_channel(DMA_CHANNEL).unwrap();
    println!("Goodbye!");
}

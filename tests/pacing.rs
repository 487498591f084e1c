use rpio_pwm::sim::SimPeripherals;
use rpio_pwm::*;

const PI3: PeripheralLayout = PeripheralLayout::PreGen4 { phys_base: 0x3f00_0000 };


#[test]
fn concurrent_acquisition_agrees_on_one_step() {
    let _ = env_logger::builder().is_test(true).try_init();
    let regs = SimPeripherals::new(PI3);
    let pacing = Pacing::new();

    let results: Vec<(u8, u32, Result<()>)> = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..8u8)
            .map(|ch| {
                let (regs, pacing) = (&regs, &pacing);
                s.spawn(move |_| {
                    let step = if ch % 2 == 0 { 10 } else { 20 };
                    let config = ChannelConfig::new(20_000, step);
                    (ch, step, pacing.acquire(regs, &config, ch))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    let winner = pacing.step_time(PacingSource::Pwm).unwrap();
    let mut users = Vec::new();
    for (ch, step, result) in results {
        if step == winner {
            assert_eq!(result, Ok(()));
            users.push(ch);
        } else {
            match result {
                Err(Error::PacingInUse { step_time_us, .. }) => assert_eq!(step_time_us, winner),
                other => panic!("channel {} got {:?}", ch, other),
            }
        }
    }
    users.sort();
    assert_eq!(pacing.users(PacingSource::Pwm), users);
    // The divider was programmed once, for the winning step.
    let rng1 = regs.writes_to(Register::new(Block::Pwm, 0x10));
    assert_eq!(rng1, vec![winner * 10]);
}

#[test]
fn concurrent_release_stops_the_peripheral_once() {
    let regs = SimPeripherals::new(PeripheralLayout::Gen4);
    let pacing = Pacing::new();
    let config = ChannelConfig::new(1000, 100).pacing(PacingSource::Pcm);
    for ch in 0..6 {
        pacing.acquire(&regs, &config, ch).unwrap();
    }
    regs.clear_writes();

    crossbeam::scope(|s| {
        for ch in 0..6u8 {
            let (regs, pacing) = (&regs, &pacing);
            s.spawn(move |_| pacing.release(regs, PacingSource::Pcm, ch));
        }
    })
    .unwrap();

    assert!(pacing.users(PacingSource::Pcm).is_empty());
    assert_eq!(regs.writes_to(Register::new(Block::Pcm, 0x00)), vec![0]);
}

#[test]
fn engines_share_nothing() {
    // Each engine keeps its own channel registry and pacing book-keeping.
    let (a, b) = (SimPeripherals::new(PI3), SimPeripherals::new(PI3));
    crossbeam::scope(|s| {
        for regs in [&a, &b].iter().cloned() {
            s.spawn(move |_| {
                let mut engine = Engine::new(regs);
                engine.init_channel(0, 3000, 10, PacingSource::Pwm, false).unwrap();
                engine.add_gpio(0, 17, 50).unwrap();
                assert_eq!(engine.ring(0).unwrap().active_slots(17).len(), 5);
            });
        }
    })
    .unwrap();
    assert_eq!(a.live_allocations(), 0);
    assert_eq!(b.live_allocations(), 0);
}

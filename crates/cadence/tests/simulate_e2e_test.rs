/// End-to-end test: machine configuration to a complete step timeline
use anyhow::Result;
use cadence::config::Config;
use cadence_core::dda::{Dda, MoveParams, PrepParams};
use cadence_core::drive_movement::DmState;
use cadence_core::pool::DmPool;
use cadence_core::shaper::ExtruderShaper;

#[test]
fn cartesian_machine_steps_a_diagonal_move() -> Result<()> {
    let toml = r#"
[machine]
step_clock_hz = 1000000.0
kinematics = "cartesian"

[[drives]]
steps_per_mm = 80.0

[[drives]]
steps_per_mm = 80.0

[[drives]]
steps_per_mm = 400.0

[[drives]]
steps_per_mm = 420.0
extruder = true
pressure_advance = 0.04
"#;
    let config = Config::from_toml(toml)?;
    config.validate()?;
    let clock = config.machine.step_clock_hz;

    // A 3-4-5 diagonal with 2.5 mm of extrusion and no Z motion.
    let dda = Dda::plan(
        &MoveParams {
            moves: vec![3.0, 4.0, 0.0, 2.5],
            speed: 50.0,
            acceleration: 1000.0,
            deceleration: 1000.0,
            end_speed: 0.0,
            use_pressure_advance: false,
        },
        clock,
    )?;
    assert!((dda.total_distance - 5.0).abs() < 1e-12);

    let params = PrepParams::new(&dda, 0.0, 0.0, None);
    let mut pool = DmPool::new();
    pool.initial_allocate(config.machine.preallocate);

    // Nominal step counts; truncation may shave one.
    let nominal = [240i64, 320, 0, 1050];
    let mut stepped_drives = 0;
    for (index, drive) in config.drives.iter().enumerate() {
        if dda.direction_vector[index] == 0.0 {
            continue;
        }
        stepped_drives += 1;
        let expected =
            (dda.total_distance * (drive.steps_per_mm * dda.direction_vector[index].abs())) as u64;
        assert!((expected as i64 - nominal[index]).abs() <= 1);

        let handle = pool.allocate(index as u8, DmState::Idle);
        let dm = pool.get_mut(handle);
        let mut shaper = ExtruderShaper::new(drive.pressure_advance * clock);
        let mut alive = if drive.extruder {
            dm.prepare_extruder(&dda, &params, drive.steps_per_mm, &mut shaper)
        } else {
            dm.prepare_cartesian_axis(&dda, &params, drive.steps_per_mm)
        };

        let mut steps = 0u64;
        let mut last_time = 0u32;
        while alive {
            assert!(
                dm.next_step_time() + 1 >= last_time,
                "drive {index} time went backwards"
            );
            last_time = dm.next_step_time();
            steps += 1;
            alive = dm.calc_next_step_time(&dda);
        }

        assert_eq!(dm.state(), DmState::Idle, "drive {index}");
        assert_eq!(steps, expected, "drive {index}");
        assert!(last_time <= dda.clocks_needed);
        pool.release(handle);
    }

    assert_eq!(stepped_drives, 3, "Z must not participate");
    assert_eq!(pool.free_count(), pool.num_created());
    println!("✓ all drives stepped to completion");
    Ok(())
}

#[test]
fn delta_machine_lowers_three_towers_in_lockstep() -> Result<()> {
    let toml = r#"
[machine]
step_clock_hz = 1000000.0
kinematics = "delta"

[machine.delta]
radius = 100.0
arm_length = 200.0

[[drives]]
steps_per_mm = 80.0

[[drives]]
steps_per_mm = 80.0

[[drives]]
steps_per_mm = 80.0
"#;
    let config = Config::from_toml(toml)?;
    config.validate()?;
    let clock = config.machine.step_clock_hz;

    let dda = Dda::plan(
        &MoveParams {
            moves: vec![0.0, 0.0, -5.0],
            speed: 20.0,
            acceleration: 500.0,
            deceleration: 500.0,
            end_speed: 0.0,
            use_pressure_advance: false,
        },
        clock,
    )?;

    let towers = config.delta_kinematics().expect("delta geometry");
    let params = PrepParams::new(&dda, 0.0, 0.0, Some(&towers));
    let mut pool = DmPool::new();
    pool.initial_allocate(config.machine.preallocate);

    let mut timelines: Vec<Vec<u32>> = Vec::new();
    for (index, drive) in config.drives.iter().enumerate() {
        let handle = pool.allocate(index as u8, DmState::Idle);
        let dm = pool.get_mut(handle);
        let mut alive = dm.prepare_delta_axis(&dda, &params, drive.steps_per_mm);

        // A pure Z descent moves every carriage down by exactly the Z
        // distance.
        assert_eq!(dm.total_steps(), 400);
        assert!(!dm.direction());

        let mut times = Vec::new();
        while alive {
            times.push(dm.next_step_time());
            alive = dm.calc_next_step_time(&dda);
        }
        assert_eq!(dm.state(), DmState::Idle);
        assert_eq!(times.len(), 400);
        assert!(!dm.direction_changed());
        timelines.push(times);
        pool.release(handle);
    }

    // The towers are symmetric, so their pulse trains must agree.
    for step in 0..400 {
        let a = timelines[0][step] as i64;
        let b = timelines[1][step] as i64;
        let c = timelines[2][step] as i64;
        assert!((a - b).abs() <= 1 && (a - c).abs() <= 1, "step {step}");
    }
    println!("✓ three towers in lockstep");
    Ok(())
}

use outbreak_core::{CellOccupancy, HealthState, OutbreakConfig, Simulation, Tick, TickTally};

fn dense_config(seed: u64) -> OutbreakConfig {
    OutbreakConfig {
        width: 16,
        height: 16,
        infection_chance: 0.4,
        infection_duration: 6,
        immunity_duration: 10,
        initial_normal: 300,
        initial_infected: 8,
        initial_immune: 4,
        tick_budget: 64,
        rng_seed: Some(seed),
    }
}

fn state_rank(state: HealthState) -> u8 {
    match state {
        HealthState::Normal => 0,
        HealthState::Infected => 1,
        HealthState::Immune => 2,
    }
}

#[test]
fn seeded_runs_advance_deterministically() {
    let mut sim_a = Simulation::new(dense_config(0xDEAD_BEEF)).expect("sim_a");
    let mut sim_b = Simulation::new(dense_config(0xDEAD_BEEF)).expect("sim_b");
    sim_a.run();
    sim_b.run();
    assert_eq!(sim_a.tick(), sim_b.tick());
    assert_eq!(sim_a.history(), sim_b.history());
    assert_eq!(sim_a.total_infections(), sim_b.total_infections());

    let mut sim_c = Simulation::new(dense_config(0x0BAD_CAFE)).expect("sim_c");
    sim_c.run();
    assert!(
        sim_a.history() != sim_c.history() || sim_a.tick() != sim_c.tick(),
        "different seeds should diverge"
    );
}

#[test]
fn population_is_conserved_every_tick() {
    let config = dense_config(17);
    let total = config.total_population();
    let mut sim = Simulation::new(config).expect("simulation");
    sim.run();
    assert!(sim.history().len() >= 2, "at least one tick should run");
    for (index, tally) in sim.history().iter().enumerate() {
        assert_eq!(
            tally.total(),
            total,
            "tick {index} lost or duplicated agents"
        );
    }
}

#[test]
fn cell_lists_sorted_by_state_band_at_setup() {
    // Ordering is only guaranteed while the lists are fresh from sorted
    // insertion; the in-place update pass leaves them ordered by the
    // previous tick's states until movement re-inserts.
    let sim = Simulation::new(dense_config(99)).expect("simulation");
    for y in 0..sim.config().height {
        for x in 0..sim.config().width {
            let mut last_rank = 0;
            for id in sim.agents_in_cell(x, y) {
                let rank = state_rank(sim.agent_health(id).expect("live agent"));
                assert!(rank >= last_rank, "list order must follow state bands");
                last_rank = rank;
            }
        }
    }
}

#[test]
fn cell_lists_expose_unique_agents_every_tick() {
    // Cram the population onto a tiny grid so every list is long and every
    // tick splices agents mid-list.
    let config = OutbreakConfig {
        width: 2,
        height: 2,
        tick_budget: 16,
        ..dense_config(777)
    };
    let mut sim = Simulation::new(config).expect("simulation");
    loop {
        let mut visited = 0;
        for y in 0..sim.config().height {
            for x in 0..sim.config().width {
                for id in sim.agents_in_cell(x, y) {
                    visited += 1;
                    assert_eq!(sim.agent_position(id), Some((x, y)));
                }
            }
        }
        assert_eq!(visited, sim.agent_count(), "every agent in exactly one cell");
        if sim.step().is_none() {
            break;
        }
    }
}

#[test]
fn occupancy_matches_cell_contents() {
    let mut sim = Simulation::new(dense_config(5)).expect("simulation");
    for _ in 0..5 {
        for y in 0..sim.config().height {
            for x in 0..sim.config().width {
                let healths: Vec<HealthState> =
                    sim.agents_in_cell(x, y).map(|id| sim.agent_health(id).unwrap()).collect();
                let expected = if healths.is_empty() {
                    CellOccupancy::Empty
                } else if healths.contains(&HealthState::Infected) {
                    CellOccupancy::Infected
                } else if healths.contains(&HealthState::Immune) {
                    CellOccupancy::Immune
                } else {
                    CellOccupancy::Normal
                };
                assert_eq!(sim.cell_occupancy(x, y), Some(expected));
            }
        }
        if sim.step().is_none() {
            break;
        }
    }
}

#[test]
fn burnout_without_transmission_terminates() {
    let config = OutbreakConfig {
        infection_chance: 0.0,
        tick_budget: -1,
        ..dense_config(123)
    };
    let cooldown = config.immunity_cooldown();
    let mut sim = Simulation::new(config).expect("simulation");
    let final_tick = sim.run();
    assert!(sim.is_finished());
    assert!(
        final_tick.0 <= u64::from(cooldown) + 1,
        "run must end once seeded infections age out"
    );
    assert_eq!(sim.latest_tally().infected, 0);
    assert_eq!(sim.history().len() as u64, final_tick.0 + 1);
}

#[test]
fn history_grows_one_tally_per_tick() {
    let mut sim = Simulation::new(dense_config(7)).expect("simulation");
    assert_eq!(sim.history().len(), 1);
    let mut expected = 1;
    while let Some(report) = sim.step() {
        expected += 1;
        assert_eq!(sim.history().len(), expected);
        assert_eq!(report.tick, Tick(expected as u64 - 1));
        assert_eq!(sim.history().last(), Some(&report.tally));
    }
}

#[test]
fn infected_count_never_rises_at_zero_chance() {
    let config = OutbreakConfig {
        infection_chance: 0.0,
        ..dense_config(31)
    };
    let mut sim = Simulation::new(config).expect("simulation");
    let mut previous = sim.latest_tally().infected;
    while let Some(report) = sim.step() {
        assert!(report.tally.infected <= previous);
        previous = report.tally.infected;
    }
}

#[test]
fn default_config_is_valid() {
    let config = OutbreakConfig::default();
    assert_eq!(config.total_population(), 65_536);
    assert_eq!(config.immunity_cooldown(), 48);
    let tallies: TickTally = TickTally::new(
        config.initial_normal,
        config.initial_infected,
        config.initial_immune,
    );
    assert_eq!(tallies.total(), config.total_population());
}

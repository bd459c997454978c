//! Core simulation engine for the Outbreak workspace.
//!
//! Agents live in a slot-map arena and are threaded into singly-linked,
//! state-sorted lists hanging off the cells of a bounded 2D grid. Each tick
//! spreads infection through shared cells, moves every agent into a second
//! (double-buffered) grid, swaps the buffers, and advances every agent's
//! cooldown counter while tallying the population by health state.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Errors raised while constructing a simulation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Externally visible health state of an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HealthState {
    Normal,
    Infected,
    Immune,
}

/// Representative contents of one grid cell, as consumed by renderers.
///
/// Priority when a cell hosts a mix of agents: `Infected` beats `Immune`
/// beats `Normal`; a cell with no agents reports `Empty`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CellOccupancy {
    Empty,
    Normal,
    Infected,
    Immune,
}

/// High level simulation clock (ticks processed since setup).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The tick recorded for the initial population, before tick 1 runs.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Per-tick population counts, one entry per tick in the history log.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickTally {
    pub normal: usize,
    pub infected: usize,
    pub immune: usize,
}

impl TickTally {
    /// Construct a tally from explicit counts.
    #[must_use]
    pub const fn new(normal: usize, infected: usize, immune: usize) -> Self {
        Self {
            normal,
            infected,
            immune,
        }
    }

    /// Total population covered by this tally.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.normal + self.infected + self.immune
    }

    fn record(&mut self, state: HealthState) {
        match state {
            HealthState::Normal => self.normal += 1,
            HealthState::Infected => self.infected += 1,
            HealthState::Immune => self.immune += 1,
        }
    }
}

/// Sink invoked after each tally is appended to the history.
pub trait TallySink: Send {
    fn on_tick(&mut self, tick: Tick, tally: TickTally);
}

/// No-op tally sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl TallySink for NullSink {
    fn on_tick(&mut self, _tick: Tick, _tally: TickTally) {}
}

/// Static configuration for an outbreak simulation.
///
/// Defaults mirror the reference launcher: a 256x256 grid, 65535 normal
/// agents and a single infected seed, and an unbounded tick budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutbreakConfig {
    /// Grid width in cells.
    pub width: u32,
    /// Grid height in cells.
    pub height: u32,
    /// Probability of each infected agent infecting each co-located normal
    /// agent per tick, in `[0, 1]`.
    pub infection_chance: f64,
    /// Number of ticks an agent stays infected before turning immune.
    pub infection_duration: u32,
    /// Number of ticks an agent stays immune before reverting to normal.
    pub immunity_duration: u32,
    /// Agents seeded in the normal state.
    pub initial_normal: usize,
    /// Agents seeded in the infected state.
    pub initial_infected: usize,
    /// Agents seeded in the immune state.
    pub initial_immune: usize,
    /// Maximum number of ticks to run; negative means unbounded.
    pub tick_budget: i64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for OutbreakConfig {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            infection_chance: 0.75,
            infection_duration: 16,
            immunity_duration: 32,
            initial_normal: 65_535,
            initial_infected: 1,
            initial_immune: 0,
            tick_budget: -1,
            rng_seed: None,
        }
    }
}

impl OutbreakConfig {
    /// Highest internal cooldown value before an agent wraps back to normal.
    ///
    /// The immune band sits directly above the infected band, so the wrap
    /// point is the sum of both durations.
    #[must_use]
    pub const fn immunity_cooldown(&self) -> u32 {
        self.infection_duration.saturating_add(self.immunity_duration)
    }

    /// Total seeded population across all three states.
    #[must_use]
    pub const fn total_population(&self) -> usize {
        self.initial_normal + self.initial_infected + self.initial_immune
    }

    /// Validates the configuration before any state is built.
    fn validate(&self) -> Result<(), SimulationError> {
        if self.width == 0 || self.height == 0 {
            return Err(SimulationError::InvalidConfig(
                "grid dimensions must be positive",
            ));
        }
        if !self.infection_chance.is_finite()
            || !(0.0..=1.0).contains(&self.infection_chance)
        {
            return Err(SimulationError::InvalidConfig(
                "infection_chance must be within [0, 1]",
            ));
        }
        if self
            .infection_duration
            .checked_add(self.immunity_duration)
            .is_none()
        {
            return Err(SimulationError::InvalidConfig(
                "cooldown durations overflow the internal counter",
            ));
        }
        if self.initial_infected > 0 && self.infection_duration == 0 {
            return Err(SimulationError::InvalidConfig(
                "cannot seed infected agents with a zero infection duration",
            ));
        }
        if self.initial_immune > 0 && self.immunity_duration == 0 {
            return Err(SimulationError::InvalidConfig(
                "cannot seed immune agents with a zero immunity duration",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, generating a seed from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// One simulated person: grid position, internal cooldown counter, the
/// pending-infection flag written by the spread pass, and the successor in
/// the owning cell's list.
#[derive(Debug, Clone, Copy)]
struct Agent {
    x: u32,
    y: u32,
    state: u32,
    pending_infection: bool,
    link: Option<AgentId>,
}

/// 2D grid of agent-list heads.
#[derive(Debug, Clone)]
struct CellGrid {
    width: u32,
    height: u32,
    heads: Vec<Option<AgentId>>,
}

impl CellGrid {
    fn new(width: u32, height: u32) -> Result<Self, SimulationError> {
        if width == 0 || height == 0 {
            return Err(SimulationError::InvalidConfig(
                "cell grid dimensions must be positive",
            ));
        }
        Ok(Self {
            width,
            height,
            heads: vec![None; (width as usize) * (height as usize)],
        })
    }

    /// Returns the flat index for `(x, y)` without bounds checks.
    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    fn head(&self, x: u32, y: u32) -> Option<AgentId> {
        if x < self.width && y < self.height {
            self.heads[self.offset(x, y)]
        } else {
            None
        }
    }

    fn in_bounds(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    /// Drops every list head, leaving an empty grid ready for reuse.
    fn clear(&mut self) {
        self.heads.fill(None);
    }
}

/// Splice `id` into the cell list for its current position, keeping the
/// list non-decreasing in internal state.
///
/// Normal agents therefore form a contiguous prefix, which is what lets the
/// spread pass and the occupancy query stop at the first non-normal entry.
fn insert_sorted(agents: &mut SlotMap<AgentId, Agent>, grid: &mut CellGrid, id: AgentId) {
    let (x, y, state) = {
        let agent = &agents[id];
        (agent.x, agent.y, agent.state)
    };
    let slot = grid.offset(x, y);
    let head = grid.heads[slot];
    match head {
        None => {
            agents[id].link = None;
            grid.heads[slot] = Some(id);
        }
        Some(head) if agents[head].state >= state => {
            agents[id].link = Some(head);
            grid.heads[slot] = Some(id);
        }
        Some(head) => {
            let mut prev = head;
            loop {
                match agents[prev].link {
                    Some(next) if agents[next].state < state => prev = next,
                    tail => {
                        agents[id].link = tail;
                        agents[prev].link = Some(id);
                        break;
                    }
                }
            }
        }
    }
}

/// Lifecycle state of the tick driver. Setup is consumed by construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Running,
    Finished,
}

/// Outcome of one processed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub tick: Tick,
    pub tally: TickTally,
    /// Whether this tick was the last one the simulation will process.
    pub finished: bool,
}

/// Iterator over the agents occupying a single cell, in list order.
pub struct CellAgents<'a> {
    agents: &'a SlotMap<AgentId, Agent>,
    cursor: Option<AgentId>,
}

impl Iterator for CellAgents<'_> {
    type Item = AgentId;

    fn next(&mut self) -> Option<AgentId> {
        let id = self.cursor?;
        self.cursor = self.agents[id].link;
        Some(id)
    }
}

/// Aggregate simulation state: config, RNG, agent arena, the double-buffered
/// cell index, and the accumulated tick history.
pub struct Simulation {
    config: OutbreakConfig,
    immunity_cooldown: u32,
    rng: SmallRng,
    agents: SlotMap<AgentId, Agent>,
    current: CellGrid,
    next: CellGrid,
    tick: Tick,
    phase: Phase,
    stop_requested: bool,
    ticks_remaining: i64,
    infections: u64,
    history: Vec<TickTally>,
    sink: Box<dyn TallySink>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("phase", &self.phase)
            .field("agent_count", &self.agents.len())
            .field("infections", &self.infections)
            .finish()
    }
}

impl Simulation {
    /// Instantiate a simulation from the supplied configuration.
    pub fn new(config: OutbreakConfig) -> Result<Self, SimulationError> {
        Self::with_sink(config, Box::new(NullSink))
    }

    /// Instantiate a simulation that forwards every tally to `sink`.
    pub fn with_sink(
        config: OutbreakConfig,
        sink: Box<dyn TallySink>,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let current = CellGrid::new(config.width, config.height)?;
        let next = current.clone();
        let total = config.total_population();
        let mut sim = Self {
            immunity_cooldown: config.immunity_cooldown(),
            ticks_remaining: config.tick_budget,
            infections: config.initial_infected as u64,
            config,
            rng,
            agents: SlotMap::with_capacity_and_key(total),
            current,
            next,
            tick: Tick::zero(),
            phase: Phase::Running,
            stop_requested: false,
            history: Vec::new(),
            sink,
        };
        sim.seed_population();
        let initial = TickTally::new(
            sim.config.initial_normal,
            sim.config.initial_infected,
            sim.config.initial_immune,
        );
        sim.history.push(initial);
        sim.sink.on_tick(Tick::zero(), initial);
        // The epidemic cannot start without an infectious agent, and a zero
        // budget leaves no ticks to run.
        if initial.infected == 0 || sim.ticks_remaining == 0 {
            sim.phase = Phase::Finished;
        }
        Ok(sim)
    }

    /// Seeds the configured population at random positions. Agents are
    /// inserted through the same sorted-insert path movement uses, into the
    /// spare grid, and a buffer swap then makes that grid current, so the
    /// sort invariant holds from tick 0 onward.
    fn seed_population(&mut self) {
        let infection = self.config.infection_duration;
        let immunity = self.immunity_cooldown;
        let groups = [
            (self.config.initial_normal, HealthState::Normal),
            (self.config.initial_infected, HealthState::Infected),
            (self.config.initial_immune, HealthState::Immune),
        ];
        for (count, seed_state) in groups {
            for _ in 0..count {
                let x = self.rng.random_range(0..self.config.width);
                let y = self.rng.random_range(0..self.config.height);
                let state = match seed_state {
                    HealthState::Normal => 0,
                    HealthState::Infected => self.rng.random_range(1..=infection),
                    HealthState::Immune => self.rng.random_range(infection + 1..=immunity),
                };
                let id = self.agents.insert(Agent {
                    x,
                    y,
                    state,
                    pending_infection: false,
                    link: None,
                });
                insert_sorted(&mut self.agents, &mut self.next, id);
            }
        }
        self.swap_buffers();
    }

    /// Execute one tick: spread, move, swap, update + tally, then decide
    /// whether the simulation continues.
    ///
    /// Returns `None` when the simulation is already finished (or a stop
    /// request is observed at this tick boundary); the tick is not run.
    pub fn step(&mut self) -> Option<TickReport> {
        if self.phase == Phase::Finished {
            return None;
        }
        if self.stop_requested {
            self.phase = Phase::Finished;
            return None;
        }

        let next_tick = self.tick.next();
        self.stage_spread();
        self.stage_movement();
        self.swap_buffers();
        let tally = self.stage_update();

        self.history.push(tally);
        self.sink.on_tick(next_tick, tally);
        self.tick = next_tick;

        if tally.infected == 0 {
            self.phase = Phase::Finished;
        } else if self.ticks_remaining > 0 {
            self.ticks_remaining -= 1;
            if self.ticks_remaining == 0 {
                self.phase = Phase::Finished;
            }
        }

        Some(TickReport {
            tick: next_tick,
            tally,
            finished: self.phase == Phase::Finished,
        })
    }

    /// Run ticks until the simulation finishes, returning the final tick.
    pub fn run(&mut self) -> Tick {
        while self.step().is_some() {}
        self.tick
    }

    /// For every infected agent, walk the normal prefix of its cell's list
    /// and roll one infection trial per susceptible neighbour. Reads only
    /// the current grid; the pending flags are consumed later by the update
    /// pass, never within this one.
    fn stage_spread(&mut self) {
        let chance = self.config.infection_chance;
        let infection = self.config.infection_duration;
        for slot in 0..self.current.heads.len() {
            let mut cursor = self.current.heads[slot];
            while let Some(id) = cursor {
                let (state, successor) = {
                    let agent = &self.agents[id];
                    (agent.state, agent.link)
                };
                if state >= 1 && state <= infection {
                    // The list is state-sorted, so susceptible agents form a
                    // contiguous prefix starting at the head.
                    let mut target = self.current.heads[slot];
                    while let Some(tid) = target {
                        let (t_state, t_next) = {
                            let agent = &self.agents[tid];
                            (agent.state, agent.link)
                        };
                        if t_state != 0 {
                            break;
                        }
                        if self.rng.random_bool(chance) {
                            self.agents[tid].pending_infection = true;
                        }
                        target = t_next;
                    }
                }
                cursor = successor;
            }
        }
    }

    /// Move every agent to a uniformly chosen legal neighbouring cell (or
    /// keep it in place) and splice it into the spare grid. Staying put is
    /// always legal, so even a corner agent has at least one candidate.
    fn stage_movement(&mut self) {
        let width = self.config.width;
        let height = self.config.height;
        for slot in 0..self.current.heads.len() {
            let mut cursor = self.current.heads[slot];
            while let Some(id) = cursor {
                // Capture the successor before the insert rewrites the link.
                cursor = self.agents[id].link;
                let (x, y) = {
                    let agent = &self.agents[id];
                    (agent.x, agent.y)
                };
                let mut moves = [(x, y); 5];
                let mut legal = 1;
                if y > 0 {
                    moves[legal] = (x, y - 1);
                    legal += 1;
                }
                if x > 0 {
                    moves[legal] = (x - 1, y);
                    legal += 1;
                }
                if y + 1 < height {
                    moves[legal] = (x, y + 1);
                    legal += 1;
                }
                if x + 1 < width {
                    moves[legal] = (x + 1, y);
                    legal += 1;
                }
                let (new_x, new_y) = moves[self.rng.random_range(0..legal)];
                {
                    let agent = &mut self.agents[id];
                    agent.x = new_x;
                    agent.y = new_y;
                }
                insert_sorted(&mut self.agents, &mut self.next, id);
            }
        }
    }

    /// Promote the freshly written grid to current and empty the spare.
    /// Ownership of every agent transfers wholesale; no cell is copied.
    fn swap_buffers(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
        self.next.clear();
    }

    /// Advance every agent's cooldown, converting pending infections into
    /// state transitions, and tally the resulting external states.
    fn stage_update(&mut self) -> TickTally {
        let immunity = self.immunity_cooldown;
        let mut tally = TickTally::default();
        for slot in 0..self.current.heads.len() {
            let mut cursor = self.current.heads[slot];
            while let Some(id) = cursor {
                let agent = &mut self.agents[id];
                if agent.pending_infection {
                    // An infection always restarts the cooldown clock,
                    // whatever the prior state.
                    agent.pending_infection = false;
                    agent.state = 1;
                    self.infections += 1;
                } else if agent.state > 0 {
                    agent.state += 1;
                    if agent.state > immunity {
                        agent.state = 0;
                    }
                }
                let state = agent.state;
                cursor = agent.link;
                tally.record(self.classify(state));
            }
        }
        tally
    }

    fn classify(&self, state: u32) -> HealthState {
        if state == 0 {
            HealthState::Normal
        } else if state <= self.config.infection_duration {
            HealthState::Infected
        } else {
            HealthState::Immune
        }
    }

    /// Returns an immutable reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &OutbreakConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether further ticks will be processed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    /// Whether the simulation has reached its terminal phase.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Ask the simulation to stop at the next tick boundary. History already
    /// recorded is retained.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Ordered per-tick tallies, starting with the initial population.
    #[must_use]
    pub fn history(&self) -> &[TickTally] {
        &self.history
    }

    /// The most recently recorded tally.
    #[must_use]
    pub fn latest_tally(&self) -> TickTally {
        self.history.last().copied().unwrap_or_default()
    }

    /// Total infection events so far, counting the seeded infected agents.
    #[must_use]
    pub const fn total_infections(&self) -> u64 {
        self.infections
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Iterate over every live agent handle.
    pub fn agent_ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.agents.keys()
    }

    /// Grid position of an agent.
    #[must_use]
    pub fn agent_position(&self, id: AgentId) -> Option<(u32, u32)> {
        self.agents.get(id).map(|agent| (agent.x, agent.y))
    }

    /// External health state of an agent.
    #[must_use]
    pub fn agent_health(&self, id: AgentId) -> Option<HealthState> {
        self.agents.get(id).map(|agent| self.classify(agent.state))
    }

    /// Iterate over the agents in `current[x][y]`, in list order. Yields
    /// nothing for out-of-bounds coordinates.
    #[must_use]
    pub fn agents_in_cell(&self, x: u32, y: u32) -> CellAgents<'_> {
        CellAgents {
            agents: &self.agents,
            cursor: self.current.head(x, y),
        }
    }

    /// Representative occupancy of a cell for rendering, or `None` when the
    /// coordinates fall outside the grid.
    #[must_use]
    pub fn cell_occupancy(&self, x: u32, y: u32) -> Option<CellOccupancy> {
        if !self.current.in_bounds(x, y) {
            return None;
        }
        let mut cursor = self.current.head(x, y);
        if cursor.is_none() {
            return Some(CellOccupancy::Empty);
        }
        while let Some(id) = cursor {
            let agent = &self.agents[id];
            match self.classify(agent.state) {
                HealthState::Normal => cursor = agent.link,
                HealthState::Infected => return Some(CellOccupancy::Infected),
                HealthState::Immune => return Some(CellOccupancy::Immune),
            }
        }
        Some(CellOccupancy::Normal)
    }
}

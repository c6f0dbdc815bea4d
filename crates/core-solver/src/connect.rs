//! Multi-model runs: wiring input variables of one solver to outputs of
//! another and arbitrating the sync points between them.
//!
//! Two sync policies, selected by `dtCon`:
//!
//! * `dtCon == 0` — event-accurate: the manager always advances the solver
//!   holding the earliest pending event, refreshing its connected inputs from
//!   the source trajectories immediately before the step. Since the chosen
//!   time is globally minimal, every source trajectory is still valid there.
//! * `dtCon > 0` — lockstep: solvers run independently between sync points
//!   at multiples of `dtCon`, with connections refreshed at each point.

use crate::solver::{SetupError, Solver};
use core_time::Time;
use core_vars::VarId;
use std::collections::BTreeMap;

struct Link {
    dst_solver: usize,
    dst_var: VarId,
    src_solver: usize,
    src_var: VarId,
}

pub struct Connections {
    solvers: Vec<Solver>,
    links: Vec<Link>,
    dt_con: Time,
    t_end: Time,
}

impl Connections {
    /// Wire `input <- output` specs of the form `model.variable`.
    pub fn new(
        mut solvers: Vec<Solver>,
        con: &BTreeMap<String, String>,
        dt_con: Time,
    ) -> Result<Self, SetupError> {
        let t_end = solvers
            .iter()
            .map(Solver::t_end)
            .fold(f64::NEG_INFINITY, f64::max);
        let mut links = Vec::new();
        for (inp, out) in con {
            let (dst_solver, dst_var) = resolve_endpoint(&solvers, inp)?;
            let (src_solver, src_var) = resolve_endpoint(&solvers, out)?;
            solvers[src_solver].mark_connected_output(src_var)?;
            solvers[dst_solver].make_connected_input(dst_var)?;
            tracing::info!(
                target: "connect",
                input = %inp,
                output = %out,
                "connection wired"
            );
            links.push(Link {
                dst_solver,
                dst_var,
                src_solver,
                src_var,
            });
        }
        Ok(Self {
            solvers,
            links,
            dt_con,
            t_end,
        })
    }

    pub fn solvers(&self) -> &[Solver] {
        &self.solvers
    }

    pub fn init(&mut self) -> Result<(), SetupError> {
        for s in &mut self.solvers {
            s.init()?;
        }
        // Seed connected inputs with the sources' initial trajectories.
        let t0: Vec<Time> = self.solvers.iter().map(Solver::time).collect();
        for li in 0..self.links.len() {
            let t = t0[self.links[li].dst_solver];
            self.push_link(li, t);
        }
        Ok(())
    }

    pub fn simulate(&mut self) -> Result<(), SetupError> {
        if self.dt_con == 0.0 {
            self.simulate_event_sync()
        } else {
            self.simulate_lockstep()
        }?;
        for s in &mut self.solvers {
            s.finish()?;
        }
        Ok(())
    }

    fn simulate_event_sync(&mut self) -> Result<(), SetupError> {
        loop {
            // The solver with the earliest pending event goes next.
            let mut best: Option<(usize, core_time::SuperdenseTime)> = None;
            for (i, s) in self.solvers.iter().enumerate() {
                if s.terminated() {
                    continue;
                }
                if let Some(st) = s.next_time() {
                    if st.t.is_finite()
                        && st.t <= self.t_end
                        && best.map_or(true, |(_, b)| st < b)
                    {
                        best = Some((i, st));
                    }
                }
            }
            let Some((i, st)) = best else { break };
            self.refresh_inputs_of(i, st.t);
            let t_end = self.t_end;
            if self.solvers[i].step_bounded(t_end)?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn simulate_lockstep(&mut self) -> Result<(), SetupError> {
        let t0 = self
            .solvers
            .iter()
            .map(Solver::time)
            .fold(f64::INFINITY, f64::min);
        let mut t_sync = t0;
        while t_sync < self.t_end {
            let t_next = (t_sync + self.dt_con).min(self.t_end);
            for i in 0..self.solvers.len() {
                self.refresh_inputs_of(i, t_sync);
            }
            for s in &mut self.solvers {
                while s.step_bounded(t_next)?.is_some() {}
            }
            t_sync = t_next;
        }
        // Final refresh so connected inputs hold the end-time values.
        for i in 0..self.solvers.len() {
            self.refresh_inputs_of(i, self.t_end);
        }
        Ok(())
    }

    fn refresh_inputs_of(&mut self, solver: usize, t: Time) {
        for li in 0..self.links.len() {
            if self.links[li].dst_solver == solver {
                self.push_link(li, t);
            }
        }
    }

    fn push_link(&mut self, li: usize, t: Time) {
        let Link {
            dst_solver,
            dst_var,
            src_solver,
            src_var,
        } = self.links[li];
        let coeffs = self.solvers[src_solver].output_coeffs(src_var, t);
        self.solvers[dst_solver].push_connection(dst_var, t, coeffs);
    }
}

fn resolve_endpoint(solvers: &[Solver], spec: &str) -> Result<(usize, VarId), SetupError> {
    let mut found: Option<(usize, VarId)> = None;
    for (i, s) in solvers.iter().enumerate() {
        let prefix = format!("{}.", s.name);
        if let Some(var_spec) = spec.strip_prefix(&prefix) {
            let id = s.resolve_connection(var_spec)?;
            if found.is_some() {
                return Err(SetupError::AmbiguousConnection(spec.to_string()));
            }
            found = Some((i, id));
        }
    }
    found.ok_or_else(|| SetupError::ConnectionNotFound(spec.to_string()))
}

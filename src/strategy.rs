use serde::Serialize;
use tracing::debug;

use crate::config::StrategyRules;
use crate::context::RaceContext;
use crate::data::Compound;
use crate::model::StintTimeModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyType {
    #[serde(rename = "1 Stop")]
    OneStop,
    #[serde(rename = "2 Stops")]
    TwoStop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyCandidate {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    pub compounds: Vec<Compound>,
    /// Stint lengths in laps, summing to the race distance.
    pub laps: Vec<u32>,
    /// Last lap of each stint but the final one.
    pub stop_laps: Vec<u32>,
    pub total_time: f64,
}

// enumerates 1- and 2-stop plans under the rule set and scores them with a
// stint-time model. no state between calls.
pub struct StrategyEngine<'a> {
    rules: &'a StrategyRules,
}

impl<'a> StrategyEngine<'a> {
    pub fn new(rules: &'a StrategyRules) -> Self {
        Self { rules }
    }

    /// Fastest plans first, at most `top_n` of them.
    pub fn find_best_strategies<M: StintTimeModel>(&self, model: &M, ctx: &RaceContext) -> Vec<StrategyCandidate> {
        let mut all = self.one_stop_candidates(model, ctx);
        all.extend(self.two_stop_candidates(model, ctx));
        debug!(candidates = all.len(), laps = ctx.total_laps, "scored strategy candidates");

        // stable, so equal times keep enumeration order
        all.sort_by(|a, b| a.total_time.total_cmp(&b.total_time));
        all.truncate(self.rules.top_n);
        all
    }

    pub fn one_stop_candidates<M: StintTimeModel>(&self, model: &M, ctx: &RaceContext) -> Vec<StrategyCandidate> {
        let laps = ctx.total_laps as i64;
        let edge = self.rules.min_edge_stint as i64;
        let mut out = Vec::new();

        for first in Compound::ALL {
            for second in Compound::ALL {
                // never step down from a harder to a softer tyre at the only stop
                if first == second || self.rules.rank(first) > self.rules.rank(second) {
                    continue;
                }
                let (max1, max2) = (self.max_life(first, ctx), self.max_life(second, ctx));
                if max1 + max2 < laps {
                    continue;
                }
                let start = edge.max(laps - max2);
                let end = max1.min(laps - edge);
                for stop in (start..end).step_by(self.rules.one_stop_step.max(1)) {
                    if stop > max1 || laps - stop > max2 {
                        continue;
                    }
                    out.push(self.score_one_stop(model, ctx, first, second, stop as u32));
                }
            }
        }
        out
    }

    pub fn two_stop_candidates<M: StintTimeModel>(&self, model: &M, ctx: &RaceContext) -> Vec<StrategyCandidate> {
        let laps = ctx.total_laps as i64;
        let edge = self.rules.min_edge_stint as i64;
        let inner = self.rules.min_inner_stint as i64;
        let step = self.rules.two_stop_step.max(1);
        let first_cap = (laps as f64 * self.rules.first_stint_share).floor() as i64;
        let mut out = Vec::new();

        for c1 in Compound::ALL {
            for c2 in Compound::ALL {
                for c3 in Compound::ALL {
                    let plan = [c1, c2, c3];
                    if c1 == c2 && c2 == c3 {
                        continue;
                    }
                    let softest = plan.iter().map(|&c| self.rules.rank(c)).min().unwrap_or(0);
                    if self.rules.rank(c1) != softest {
                        continue;
                    }
                    let [max1, max2, max3] = plan.map(|c| self.max_life(c, ctx));
                    if max1 + max2 + max3 < laps {
                        continue;
                    }

                    for s1 in (inner..max1.min(first_cap)).step_by(step) {
                        let limit2 = max2.min(laps - s1 - inner);
                        for len2 in (inner..limit2).step_by(step) {
                            let len3 = laps - s1 - len2;
                            if len3 < edge || len3 > max3 {
                                continue;
                            }
                            out.push(self.score_two_stop(model, ctx, plan, s1 as u32, len2 as u32));
                        }
                    }
                }
            }
        }
        out
    }

    // one stop at the end of lap `stop`
    pub fn score_one_stop<M: StintTimeModel>(
        &self,
        model: &M,
        ctx: &RaceContext,
        first: Compound,
        second: Compound,
        stop: u32,
    ) -> StrategyCandidate {
        let rest = ctx.total_laps - stop;
        let t1 = model.stint_time(first, 1, stop);
        let t2 = model.stint_time(second, stop + 1, rest);
        StrategyCandidate {
            strategy_type: StrategyType::OneStop,
            compounds: vec![first, second],
            laps: vec![stop, rest],
            stop_laps: vec![stop],
            total_time: t1 + t2 + ctx.pit_loss_seconds + self.rules.launch_penalty.get(first),
        }
    }

    pub fn score_two_stop<M: StintTimeModel>(
        &self,
        model: &M,
        ctx: &RaceContext,
        plan: [Compound; 3],
        s1: u32,
        len2: u32,
    ) -> StrategyCandidate {
        let len3 = ctx.total_laps - s1 - len2;
        let t1 = model.stint_time(plan[0], 1, s1);
        let t2 = model.stint_time(plan[1], s1 + 1, len2);
        let t3 = model.stint_time(plan[2], s1 + len2 + 1, len3);
        StrategyCandidate {
            strategy_type: StrategyType::TwoStop,
            compounds: plan.to_vec(),
            laps: vec![s1, len2, len3],
            stop_laps: vec![s1, s1 + len2],
            total_time: t1
                + t2
                + t3
                + 2.0 * ctx.pit_loss_seconds
                + self.rules.launch_penalty.get(plan[0])
                + self.rules.multi_stop_bias,
        }
    }

    fn max_life(&self, compound: Compound, ctx: &RaceContext) -> i64 {
        self.rules.max_life(compound, ctx.total_laps) as i64
    }
}

//! Production collaborator: item recipes, learning curves, and the labor
//! pool an employer accumulates from LABOR_TIME_SEND deliveries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::LandHolding;

/// Labor ticks on hand, bucketed by worker skill level. Higher-skilled labor
/// may satisfy lower-skilled requirements; consumption drains the highest
/// skills first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaborPool {
    buckets: Vec<(f64, f64)>,
}

impl LaborPool {
    pub fn credit(&mut self, skill: f64, ticks: f64) {
        for (s, t) in self.buckets.iter_mut() {
            if (*s - skill).abs() < 1e-9 {
                *t += ticks;
                return;
            }
        }
        self.buckets.push((skill, ticks));
        self.buckets.sort_by(|a, b| b.0.partial_cmp(&a.0).expect("skill is not NaN"));
    }

    pub fn total_ticks(&self) -> f64 {
        self.buckets.iter().map(|(_, t)| t).sum()
    }

    /// Ticks available at or above `min_skill`.
    pub fn available_at(&self, min_skill: f64) -> f64 {
        self.buckets.iter().filter(|(s, _)| *s >= min_skill).map(|(_, t)| t).sum()
    }

    /// How many of `requirements` (min_skill -> ticks, consumed in
    /// descending skill order) this pool can satisfy, as a fraction in
    /// [0, 1] of the full requirement set.
    pub fn feasible_fraction(&self, requirements: &[(f64, f64)]) -> f64 {
        let mut fraction: f64 = 1.0;
        let mut remaining = self.buckets.clone();
        let mut sorted: Vec<(f64, f64)> = requirements.to_vec();
        sorted.sort_by(|a, b| b.0.partial_cmp(&a.0).expect("skill is not NaN"));

        for (min_skill, ticks_needed) in sorted {
            if ticks_needed <= 0.0 {
                continue;
            }
            let mut satisfied = 0.0;
            for (skill, ticks) in remaining.iter_mut() {
                if *skill < min_skill {
                    break;
                }
                let take = ticks.min(ticks_needed - satisfied);
                *ticks -= take;
                satisfied += take;
                if satisfied >= ticks_needed {
                    break;
                }
            }
            fraction = fraction.min(satisfied / ticks_needed);
        }
        fraction.max(0.0)
    }

    /// Debit `requirements` scaled by `fraction`. Callers check feasibility
    /// first; drains what is present if called beyond it.
    pub fn consume(&mut self, requirements: &[(f64, f64)], fraction: f64) {
        let mut sorted: Vec<(f64, f64)> = requirements.to_vec();
        sorted.sort_by(|a, b| b.0.partial_cmp(&a.0).expect("skill is not NaN"));

        for (min_skill, ticks) in sorted {
            let mut needed = ticks * fraction;
            for (skill, available) in self.buckets.iter_mut() {
                if *skill < min_skill || needed <= 0.0 {
                    continue;
                }
                let take = available.min(needed);
                *available -= take;
                needed -= take;
            }
        }
        self.buckets.retain(|(_, t)| *t > 1e-12);
    }

    /// Labor delivered this step is spent or lost: cleared at step roll-over.
    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// Land needed before production of an item can start. The allocation name
/// is the item id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandRequirement {
    /// Units producible per hectare per step.
    pub max_yield_per_hectare: f64,
    #[serde(default)]
    pub min_hectares: f64,
}

/// A capital good that must be on hand before production can start.
/// Like land it is occupied, not consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedItemRequirement {
    /// Units producible per unit of this item per step. None means the item
    /// gates production without capping throughput.
    #[serde(default)]
    pub max_yield: Option<f64>,
    /// Smallest holding that enables production at all.
    #[serde(default)]
    pub min_quantity: f64,
    /// If set, the holding is only productive in increments of
    /// `min_quantity` (half a tractor does not help).
    #[serde(default)]
    pub quantized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningCurve {
    pub starting_efficiency: f64,
    pub half_life_quantity: f64,
}

/// What it takes to produce one item, at perfect efficiency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub land: Option<LandRequirement>,
    /// item -> capital threshold that must be held, not consumed.
    #[serde(default)]
    pub fixed_items: HashMap<String, FixedItemRequirement>,
    /// min_skill -> ticks, required once per step regardless of quantity.
    #[serde(default)]
    pub fixed_labor: Vec<(f64, f64)>,
    /// item -> quantity consumed per unit produced.
    #[serde(default)]
    pub variable_items: HashMap<String, f64>,
    /// min_skill -> ticks per unit produced.
    #[serde(default)]
    pub variable_labor: Vec<(f64, f64)>,
    #[serde(default)]
    pub learning_curve: Option<LearningCurve>,
}

/// One item definition from the item data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDef {
    pub id: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub production: Option<Recipe>,
    #[serde(default)]
    pub utility: Option<UtilityParams>,
    /// nutrient -> amount per unit consumed.
    #[serde(default)]
    pub nutrients: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityParams {
    pub base_utility: super::utility::NormalParams,
    pub diminishing_factor: super::utility::NormalParams,
}

/// Everything of the agent's state a production decision may read.
pub struct ProductionView<'a> {
    pub inventory: &'a HashMap<String, f64>,
    pub land: &'a HashMap<String, LandHolding>,
    pub labor: &'a LaborPool,
}

/// The inputs the runtime must debit to produce a given quantity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductionInputs {
    pub items: HashMap<String, f64>,
    /// item -> quantity that must be on hand; occupied, not consumed.
    pub fixed_items: HashMap<String, f64>,
    /// (allocation, hectares) that must be allocated; land is occupied, not
    /// consumed.
    pub land: Option<(String, f64)>,
    /// min_skill -> ticks of labor consumed from the labor pool.
    pub labor: Vec<(f64, f64)>,
}

/// The contract the agent runtime calls into. Implementations decide input
/// requirements and feasible output; the runtime owns the debits.
pub trait ProductionFunction: Send + Sync {
    fn inputs_for(&self, target_quantity: f64) -> ProductionInputs;
    fn max_production(&self, view: &ProductionView<'_>) -> f64;
    /// Feed the learning curve after a successful production run.
    fn record_produced(&mut self, quantity: f64);
}

/// Recipe-driven production with a halving learning curve: inefficiency is
/// cut in half for every `half_life_quantity` units ever produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeProduction {
    pub item_id: String,
    pub recipe: Recipe,
    pub produced_total: f64,
}

impl RecipeProduction {
    pub fn new(def: &ItemDef) -> Option<Self> {
        def.production.as_ref().map(|recipe| Self {
            item_id: def.id.clone(),
            recipe: recipe.clone(),
            produced_total: 0.0,
        })
    }

    fn efficiency(&self) -> f64 {
        match &self.recipe.learning_curve {
            Some(curve) => {
                let start_inefficiency = 1.0 - curve.starting_efficiency;
                let inefficiency =
                    start_inefficiency / 2f64.powf(self.produced_total / curve.half_life_quantity);
                1.0 - inefficiency
            }
            None => 1.0,
        }
    }
}

impl ProductionFunction for RecipeProduction {
    fn inputs_for(&self, target_quantity: f64) -> ProductionInputs {
        let efficiency = self.efficiency();
        let mut inputs = ProductionInputs::default();

        for (item_id, per_unit) in &self.recipe.variable_items {
            inputs
                .items
                .insert(item_id.clone(), per_unit * target_quantity / efficiency);
        }
        for (item_id, requirement) in &self.recipe.fixed_items {
            inputs.fixed_items.insert(item_id.clone(), requirement.min_quantity);
        }
        if let Some(land) = &self.recipe.land {
            // Yield per hectare scales with the learning curve, so an
            // inefficient producer needs more land for the same output.
            let hectares = land
                .min_hectares
                .max(target_quantity / (land.max_yield_per_hectare * efficiency));
            inputs.land = Some((self.item_id.clone(), hectares));
        }
        for (skill, ticks) in &self.recipe.fixed_labor {
            inputs.labor.push((*skill, *ticks));
        }
        for (skill, ticks_per_unit) in &self.recipe.variable_labor {
            inputs.labor.push((*skill, ticks_per_unit * target_quantity / efficiency));
        }
        inputs
    }

    fn max_production(&self, view: &ProductionView<'_>) -> f64 {
        let efficiency = self.efficiency();
        let mut max: f64 = f64::INFINITY;

        if let Some(land) = &self.recipe.land {
            let allocated = view.land.get(&self.item_id).map(|h| h.allocated).unwrap_or(0.0);
            if allocated < land.min_hectares || allocated <= 0.0 {
                return 0.0;
            }
            max = max.min(allocated * land.max_yield_per_hectare * efficiency);
        }

        for (item_id, requirement) in &self.recipe.fixed_items {
            let held = view.inventory.get(item_id).copied().unwrap_or(0.0);
            if held < requirement.min_quantity || held <= 0.0 {
                return 0.0;
            }
            let usable = if requirement.quantized && requirement.min_quantity > 0.0 {
                (held / requirement.min_quantity).floor() * requirement.min_quantity
            } else {
                held
            };
            if let Some(max_yield) = requirement.max_yield {
                max = max.min(usable * max_yield * efficiency);
            }
        }

        for (skill, ticks) in &self.recipe.fixed_labor {
            if view.labor.available_at(*skill) < *ticks {
                return 0.0;
            }
        }

        for (item_id, per_unit) in &self.recipe.variable_items {
            let available = view.inventory.get(item_id).copied().unwrap_or(0.0);
            max = max.min(available * efficiency / per_unit);
        }

        if !self.recipe.variable_labor.is_empty() {
            // Fixed labor is spoken for; the rest of the pool bounds variable
            // labor. Binary-search the largest feasible quantity.
            let mut pool = view.labor.clone();
            pool.consume(&self.recipe.fixed_labor, 1.0);
            let ticks_per_unit: Vec<(f64, f64)> = self
                .recipe
                .variable_labor
                .iter()
                .map(|(s, t)| (*s, t / efficiency))
                .collect();

            let mut lo = 0.0_f64;
            let mut hi = if max.is_finite() { max } else { pool.total_ticks().max(1.0) * 1e3 };
            for _ in 0..64 {
                let mid = (lo + hi) / 2.0;
                let required: Vec<(f64, f64)> =
                    ticks_per_unit.iter().map(|(s, t)| (*s, t * mid)).collect();
                if pool.feasible_fraction(&required) >= 1.0 {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            max = max.min(lo);
        }

        if max.is_finite() {
            max.max(0.0)
        } else {
            0.0
        }
    }

    fn record_produced(&mut self, quantity: f64) {
        self.produced_total += quantity;
    }
}

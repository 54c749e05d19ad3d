//! Nutrition tracking for agents with hunger enabled.
//!
//! The tracker keeps per-nutrient balances that decay every step. When a
//! nutrient stays depleted for `hungry_threshold` consecutive steps the
//! agent is marked hungry; the flag is exposed to controllers and has no
//! runtime-level consequence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::trade::ItemContainer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionSettings {
    /// nutrient -> amount consumed per step.
    pub decay_per_step: HashMap<String, f64>,
    /// Steps a nutrient may stay depleted before the agent counts as hungry.
    #[serde(default = "default_hungry_threshold")]
    pub hungry_threshold: u32,
    #[serde(default)]
    pub auto_eat: bool,
    /// What to buy when a nutrient runs low: nutrient -> (item, quantity).
    #[serde(default)]
    pub food_rules: HashMap<String, FoodRule>,
}

fn default_hungry_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodRule {
    pub item_id: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionTracker {
    pub settings: NutritionSettings,
    pub balances: HashMap<String, f64>,
    pub depleted_steps: HashMap<String, u32>,
    pub hungry: bool,
}

impl NutritionTracker {
    pub fn new(settings: NutritionSettings) -> Self {
        let balances = settings.decay_per_step.keys().map(|k| (k.clone(), 0.0)).collect();
        Self { settings, balances, depleted_steps: HashMap::new(), hungry: false }
    }

    /// Credit nutrients from a consumed container, given the item's
    /// nutrient content per unit.
    pub fn consume(&mut self, container: &ItemContainer, nutrients_per_unit: &HashMap<String, f64>) {
        for (nutrient, per_unit) in nutrients_per_unit {
            *self.balances.entry(nutrient.clone()).or_insert(0.0) +=
                per_unit * container.quantity;
        }
    }

    /// Apply one step of decay and update the hungry flag.
    pub fn step_decay(&mut self) {
        for (nutrient, decay) in &self.settings.decay_per_step {
            let balance = self.balances.entry(nutrient.clone()).or_insert(0.0);
            *balance = (*balance - decay).max(0.0);

            let streak = self.depleted_steps.entry(nutrient.clone()).or_insert(0);
            if *balance <= 0.0 {
                *streak += 1;
            } else {
                *streak = 0;
            }
        }
        self.hungry = self
            .depleted_steps
            .values()
            .any(|streak| *streak >= self.settings.hungry_threshold);
    }

    /// Containers the agent should acquire this step: one per food rule
    /// whose nutrient does not cover the coming decay.
    pub fn requirement(&self) -> Vec<ItemContainer> {
        let mut needed = Vec::new();
        for (nutrient, rule) in &self.settings.food_rules {
            let balance = self.balances.get(nutrient).copied().unwrap_or(0.0);
            let decay = self.settings.decay_per_step.get(nutrient).copied().unwrap_or(0.0);
            if balance < decay {
                needed.push(ItemContainer::new(rule.item_id.clone(), rule.quantity));
            }
        }
        needed
    }
}

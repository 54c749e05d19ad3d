//! Per-agent flow accounting: cumulative totals, per-step deltas and an
//! exponential moving average rolled once per step.

use serde::{Deserialize, Serialize};

use crate::packets::Cents;

/// Smoothing factor applied to every counter unless overridden in settings.
pub const DEFAULT_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowCounter {
    pub total: Cents,
    pub step: Cents,
    pub ema: f64,
}

impl FlowCounter {
    pub fn record(&mut self, amount: Cents) {
        self.total += amount;
        self.step += amount;
    }

    /// Reversal of a provisional debit that failed: the recorded outflow
    /// never happened.
    pub fn unrecord(&mut self, amount: Cents) {
        self.total -= amount;
        self.step -= amount;
    }

    fn roll_step(&mut self, alpha: f64) {
        self.ema = alpha * self.step as f64 + (1.0 - alpha) * self.ema;
        self.step = 0;
    }
}

/// Which flow a currency movement belongs to. Classified from the payment id
/// prefix so the receiving side books the same flow as the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Trade,
    Land,
    Labor,
    Plain,
}

impl FlowKind {
    pub fn from_payment_id(payment_id: &str) -> Self {
        if payment_id.starts_with("landtrade_") {
            FlowKind::Land
        } else if payment_id.starts_with("trade_") {
            FlowKind::Trade
        } else if payment_id.starts_with("wage_") {
            FlowKind::Labor
        } else {
            FlowKind::Plain
        }
    }
}

/// All tracked flows for one agent. Updated under the same lock as the
/// balance change that caused them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub currency_inflow: FlowCounter,
    pub currency_outflow: FlowCounter,
    pub trade_revenue: FlowCounter,
    pub trade_expense: FlowCounter,
    pub land_revenue: FlowCounter,
    pub land_expense: FlowCounter,
    pub labor_income: FlowCounter,
    pub labor_expense: FlowCounter,
}

impl Ledger {
    pub fn record_inflow(&mut self, amount: Cents, kind: FlowKind) {
        self.currency_inflow.record(amount);
        match kind {
            FlowKind::Trade => self.trade_revenue.record(amount),
            FlowKind::Land => self.land_revenue.record(amount),
            FlowKind::Labor => self.labor_income.record(amount),
            FlowKind::Plain => {}
        }
    }

    pub fn record_outflow(&mut self, amount: Cents, kind: FlowKind) {
        self.currency_outflow.record(amount);
        match kind {
            FlowKind::Trade => self.trade_expense.record(amount),
            FlowKind::Land => self.land_expense.record(amount),
            FlowKind::Labor => self.labor_expense.record(amount),
            FlowKind::Plain => {}
        }
    }

    pub fn reverse_outflow(&mut self, amount: Cents, kind: FlowKind) {
        self.currency_outflow.unrecord(amount);
        match kind {
            FlowKind::Trade => self.trade_expense.unrecord(amount),
            FlowKind::Land => self.land_expense.unrecord(amount),
            FlowKind::Labor => self.labor_expense.unrecord(amount),
            FlowKind::Plain => {}
        }
    }

    /// Close the step's accounting: fold step deltas into the EMAs.
    pub fn roll_step(&mut self, alpha: f64) {
        self.currency_inflow.roll_step(alpha);
        self.currency_outflow.roll_step(alpha);
        self.trade_revenue.roll_step(alpha);
        self.trade_expense.roll_step(alpha);
        self.land_revenue.roll_step(alpha);
        self.land_expense.roll_step(alpha);
        self.labor_income.roll_step(alpha);
        self.labor_expense.roll_step(alpha);
    }
}

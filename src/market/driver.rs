use std::sync::Arc;
use std::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use log::{debug, info};

use crate::config::{MAX_PRICE_CHANGE, PRICE_FLOOR};
use crate::market::{PriceEntry, PriceTable};
use crate::websocket::BroadcastHub;

/// Applies a fractional change to `price` and clamps the result to the floor.
pub fn apply_change(price: f64, pct: f64) -> f64 {
    (price * (1.0 + pct)).max(PRICE_FLOOR)
}

/// Random-walk simulator: every tick moves each symbol by a uniform draw in
/// `[-MAX_PRICE_CHANGE, +MAX_PRICE_CHANGE]` and then publishes the full table.
pub struct PriceDriver {
    table: Arc<PriceTable>,
    hub: Arc<BroadcastHub>,
    period: Duration,
    rng: StdRng,
}

impl PriceDriver {
    pub fn new(table: Arc<PriceTable>, hub: Arc<BroadcastHub>, period: Duration) -> Self {
        Self {
            table,
            hub,
            period,
            rng: StdRng::from_entropy(),
        }
    }

    /// One tick with random draws. Returns how many clients got the snapshot.
    pub fn tick(&mut self) -> usize {
        let rng = &mut self.rng;
        run_tick(&self.table, &self.hub, |_| {
            rng.gen_range(-MAX_PRICE_CHANGE..=MAX_PRICE_CHANGE)
        })
    }

    /// Runs the driver until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + self.period, self.period);
            info!("Price driver started (every {:?}, {} symbols)", self.period, self.table.symbol_count());

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let delivered = self.tick();
                        debug!("Tick published to {} clients", delivered);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Price driver stopped");
        })
    }
}

fn run_tick<F>(table: &PriceTable, hub: &BroadcastHub, mut draw: F) -> usize
where
    F: FnMut(&PriceEntry) -> f64,
{
    table.apply_perturbation(|entry| {
        let new_price = apply_change(entry.price, draw(entry));
        debug!("Updated {} price to {:.2}", entry.symbol, new_price);
        new_price
    });

    // Every symbol has moved before anyone sees the generation.
    hub.publish(&table.snapshot())
}

#[cfg(test)]
impl PriceDriver {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// One tick where `draw` supplies the fractional change for each symbol.
    pub fn tick_with<F>(&self, draw: F) -> usize
    where
        F: FnMut(&PriceEntry) -> f64,
    {
        run_tick(&self.table, &self.hub, draw)
    }
}

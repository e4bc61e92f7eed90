//! Runs the orchestrator against the in-process ledger with compressed timing.
//!
//! `SIM_ROUNDS` (default 3) settles that many SOL rounds, then shuts down.
//! Block 1 is left under its threshold so its pool rolls forward every round.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{info, warn};

use anchor_lang::prelude::Pubkey;
use rig_it_orchestrator::{
    constants::{PUMP_BLOCK_ID, SOL_BLOCK_ID},
    telemetry, BuybackConfig, BuybackExecutor, LedgerEvent, MachineConfig, MemoryLedger,
    OrchestratorConfig, OrchestratorResult, RoundMachine, Scheduler, SecretVault, StateStore,
    SwapVenue, TimingParams,
};

/// Prints what a real venue would do and echoes the input amount back.
struct LoggingVenue;

#[async_trait]
impl SwapVenue for LoggingVenue {
    fn name(&self) -> &str {
        "logging"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn swap(
        &self,
        input_mint: Pubkey,
        output_mint: Pubkey,
        amount: u64,
        max_slippage_bps: u16,
    ) -> OrchestratorResult<u64> {
        info!(%input_mint, %output_mint, amount, max_slippage_bps, "swap");
        Ok(amount)
    }

    async fn burn(&self, mint: Pubkey, amount: u64) -> OrchestratorResult<()> {
        info!(%mint, amount, "burn");
        Ok(())
    }

    async fn add_liquidity_locked(
        &self,
        pair_mint: Pubkey,
        pair_amount: u64,
        rig_mint: Pubkey,
        rig_amount: u64,
        lock_months: u32,
    ) -> OrchestratorResult<()> {
        info!(%pair_mint, pair_amount, %rig_mint, rig_amount, lock_months, "add liquidity");
        Ok(())
    }
}

/// Places a handful of random deposits into every exploration that opens.
async fn run_depositors(ledger: Arc<MemoryLedger>, mut shutdown: watch::Receiver<bool>) {
    let mut events = ledger.subscribe();
    let mut nonce = 0u64;
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = events.recv() => event,
        };
        let started = match event {
            Ok(LedgerEvent::ExplorationStarted(e)) => e,
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };

        let deposits: Vec<(u8, u64, u64)> = {
            let mut rng = rand::thread_rng();
            (0..6)
                .map(|_| {
                    let amount = match started.block_id {
                        SOL_BLOCK_ID => rng.gen_range(200_000_000..800_000_000),
                        _ => rng.gen_range(1_000_000..5_000_000),
                    };
                    (rng.gen_range(0..36), amount, rng.gen_range(0..10_000_000_000))
                })
                .collect()
        };
        for (rig, amount, holding) in deposits {
            nonce += 1;
            if let Err(e) = ledger.deposit(
                Pubkey::new_unique(),
                started.block_id,
                rig,
                amount,
                holding,
                nonce,
            ) {
                warn!(block_id = started.block_id, error = %e, "deposit rejected");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OrchestratorConfig::from_env().context("loading configuration")?;
    telemetry::init(config.log_json).context("initialising tracing")?;

    let rounds: u64 = std::env::var("SIM_ROUNDS")
        .ok()
        .map(|v| v.parse())
        .transpose()
        .context("SIM_ROUNDS")?
        .unwrap_or(3);

    let timing = TimingParams::new(30, 10, 5)?;
    let ledger = Arc::new(MemoryLedger::new(timing, config.split));
    for block in &config.blocks {
        ledger.add_block(block.id, block.mint, block.decimals, block.min_threshold);
    }

    let machine = Arc::new(RoundMachine::new(
        ledger.clone(),
        Arc::new(SecretVault::new()),
        MachineConfig {
            timing,
            ..config.machine_config()
        },
    ));
    let executor = Arc::new(BuybackExecutor::new(
        BuybackConfig {
            rig_mint: config.rig_mint.unwrap_or_else(Pubkey::new_unique),
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            ..config.buyback_config()
        },
        None,
        Arc::new(LoggingVenue),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = Scheduler::new(machine, ledger.program_id(), config.block_ids())
        .with_rescan_interval(Duration::from_secs(5))
        .with_buyback(executor.clone());

    let scheduler_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(rx).await })
    };
    let executor_task = tokio::spawn(executor.clone().run(shutdown_rx.clone()));
    let depositor_task = tokio::spawn(run_depositors(ledger.clone(), shutdown_rx));

    info!(rounds, "simulation running, ctrl-c to stop early");
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = tick.tick() => {
                let sol = ledger.block(SOL_BLOCK_ID).await?;
                if sol.total_explorations_completed >= rounds {
                    break;
                }
            }
        }
    }

    shutdown_tx.send(true).ok();
    scheduler_task.await??;
    executor_task.await?;
    depositor_task.await?;

    let sol = ledger.block(SOL_BLOCK_ID).await?;
    let pump = ledger.block(PUMP_BLOCK_ID).await?;
    info!(
        sol_completed = sol.total_explorations_completed,
        sol_volume = sol.total_volume,
        pump_index = pump.current_exploration_index,
        buybacks_pending = executor.pending().len(),
        "simulation finished"
    );
    Ok(())
}

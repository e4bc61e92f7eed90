use anchor_lang::prelude::*;

pub mod buyback;
pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod instructions;
pub mod machine;
pub mod scheduler;
pub mod secrets;
pub mod settlement;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use buyback::{BuybackConfig, BuybackExecutor, BuybackJob, BuybackStatus, SwapVenue};
pub use config::{BlockConfig, OrchestratorConfig};
pub use errors::{ErrorClass, OrchestratorError, OrchestratorResult, RigItError};
pub use events::LedgerEvent;
pub use instructions::RetryPolicy;
pub use machine::{FinalizeOutcome, MachineConfig, RoundMachine, StartOutcome};
pub use scheduler::{Scheduler, TaskKey, TaskState};
pub use secrets::SecretVault;
pub use settlement::{FeeSplit, Payout, Settlement};
pub use state::{ExplorationState, ExplorationStatus, RoundId};
pub use store::{MemoryLedger, StateStore, SubmitOutcome, Transition};
pub use utils::{ExplorationTiming, TimingParams};

// Address of the deployed ledger program whose accounts and events this crate reads.
declare_id!("4i1WXhRcQ4PpamLrqUKaqUAK5JhZbzbFFUuQcZ4CRxFf");

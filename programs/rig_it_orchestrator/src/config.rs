use std::str::FromStr;
use std::time::Duration;

use anchor_lang::prelude::Pubkey;
use anchor_spl::token::spl_token::native_mint;

use crate::buyback::BuybackConfig;
use crate::constants::*;
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::instructions::RetryPolicy;
use crate::machine::MachineConfig;
use crate::settlement::FeeSplit;
use crate::utils::TimingParams;

pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8899";
const PLACEHOLDER_MINT: &str = "11111111111111111111111111111111";

/// One Block: the asset it accepts and the pool it needs to settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockConfig {
    pub id: u8,
    pub label: &'static str,
    pub mint: Pubkey,
    pub decimals: u8,
    pub min_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub rpc_url: String,
    pub ws_url: String,
    pub program_id: Pubkey,
    pub operator_keypair_path: Option<String>,
    pub blocks: Vec<BlockConfig>,
    pub timing: TimingParams,
    pub split: FeeSplit,
    pub retry: RetryPolicy,
    pub buyback_min_delay_hours: u64,
    pub buyback_max_delay_hours: u64,
    pub privacy_enabled: bool,
    pub privacy_api_url: Option<String>,
    /// Buybacks are skipped while unset.
    pub rig_mint: Option<Pubkey>,
    pub log_json: bool,
}

impl OrchestratorConfig {
    pub fn from_env() -> OrchestratorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source. Unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> OrchestratorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let rpc_url = get("SOLANA_RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
        let ws_url = match get("SOLANA_WS_URL") {
            Some(url) => url,
            None => derive_ws_url(&rpc_url)?,
        };
        let program_id = match get("RIG_IT_PROGRAM_ID") {
            Some(v) => parse_pubkey("RIG_IT_PROGRAM_ID", &v)?,
            None => crate::ID,
        };

        let pump_mint = get("PUMP_TOKEN_MINT").unwrap_or_else(|| PLACEHOLDER_MINT.to_string());
        let skr_mint = get("SKR_TOKEN_MINT").unwrap_or_else(|| PLACEHOLDER_MINT.to_string());
        let blocks = vec![
            BlockConfig {
                id: SOL_BLOCK_ID,
                label: "SOL",
                mint: native_mint::ID,
                decimals: 9,
                min_threshold: parse_or(&get, "SOL_BLOCK_MIN_THRESHOLD", DEFAULT_SOL_MIN_THRESHOLD)?,
            },
            BlockConfig {
                id: PUMP_BLOCK_ID,
                label: "PUMP",
                mint: parse_pubkey("PUMP_TOKEN_MINT", &pump_mint)?,
                decimals: 6,
                min_threshold: parse_or(&get, "PUMP_BLOCK_MIN_THRESHOLD", DEFAULT_PUMP_MIN_THRESHOLD)?,
            },
            BlockConfig {
                id: SKR_BLOCK_ID,
                label: "SKR",
                mint: parse_pubkey("SKR_TOKEN_MINT", &skr_mint)?,
                decimals: 6,
                min_threshold: parse_or(&get, "SKR_BLOCK_MIN_THRESHOLD", DEFAULT_SKR_MIN_THRESHOLD)?,
            },
        ];

        let timing = TimingParams::new(
            parse_or(&get, "ACTIVE_DURATION_SECS", DEFAULT_ACTIVE_DURATION_SECS)?,
            parse_or(&get, "COOLDOWN_DURATION_SECS", DEFAULT_COOLDOWN_DURATION_SECS)?,
            parse_or(&get, "ANTI_SNIPE_WINDOW_SECS", DEFAULT_ANTI_SNIPE_WINDOW_SECS)?,
        )?;

        let retry = RetryPolicy {
            max_elapsed: Duration::from_secs(parse_or(
                &get,
                "RETRY_MAX_ELAPSED_SECS",
                DEFAULT_RETRY_MAX_ELAPSED_SECS,
            )?),
            ..RetryPolicy::default()
        };

        let rig_mint = get("RIG_TOKEN_MINT")
            .map(|v| parse_pubkey("RIG_TOKEN_MINT", &v))
            .transpose()?;

        let config = Self {
            rpc_url,
            ws_url,
            program_id,
            operator_keypair_path: get("OPERATOR_KEYPAIR_PATH"),
            blocks,
            timing,
            split: FeeSplit::default(),
            retry,
            buyback_min_delay_hours: parse_or(
                &get,
                "BUYBACK_MIN_DELAY_HOURS",
                DEFAULT_BUYBACK_MIN_DELAY_HOURS,
            )?,
            buyback_max_delay_hours: parse_or(
                &get,
                "BUYBACK_MAX_DELAY_HOURS",
                DEFAULT_BUYBACK_MAX_DELAY_HOURS,
            )?,
            privacy_enabled: parse_or(&get, "PRIVACY_CASH_ENABLED", false)?,
            privacy_api_url: get("PRIVACY_CASH_API_URL"),
            rig_mint,
            log_json: parse_or(&get, "RIG_IT_LOG_JSON", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.buyback_min_delay_hours > self.buyback_max_delay_hours {
            return Err(OrchestratorError::Config(format!(
                "buyback min delay {}h exceeds max delay {}h",
                self.buyback_min_delay_hours, self.buyback_max_delay_hours
            )));
        }
        if self.privacy_enabled && self.privacy_api_url.is_none() {
            return Err(OrchestratorError::Config(
                "PRIVACY_CASH_ENABLED requires PRIVACY_CASH_API_URL".into(),
            ));
        }
        self.split.validate()?;
        Ok(())
    }

    pub fn block_ids(&self) -> Vec<u8> {
        self.blocks.iter().map(|b| b.id).collect()
    }

    pub fn block(&self, id: u8) -> Option<&BlockConfig> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            timing: self.timing,
            split: self.split,
            retry: self.retry,
            ..MachineConfig::default()
        }
    }

    pub fn buyback_config(&self) -> BuybackConfig {
        BuybackConfig {
            rig_mint: self.rig_mint.unwrap_or_default(),
            min_delay: Duration::from_secs(self.buyback_min_delay_hours * 3600),
            max_delay: Duration::from_secs(self.buyback_max_delay_hours * 3600),
            ..BuybackConfig::default()
        }
    }
}

/// `http` -> `ws`, `https` -> `wss`, and the RPC port + 1 as the validator does.
fn derive_ws_url(rpc_url: &str) -> OrchestratorResult<String> {
    let (scheme, rest) = if let Some(rest) = rpc_url.strip_prefix("https://") {
        ("wss://", rest)
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        ("ws://", rest)
    } else {
        return Err(OrchestratorError::Config(format!(
            "SOLANA_RPC_URL must be http(s): {rpc_url}"
        )));
    };

    let (host, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let host = match host.rsplit_once(':') {
        Some((name, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| OrchestratorError::Config(format!("bad port in {rpc_url}")))?;
            format!("{name}:{}", port.saturating_add(1))
        }
        None => host.to_string(),
    };
    Ok(format!("{scheme}{host}{path}"))
}

fn parse_pubkey(key: &str, value: &str) -> OrchestratorResult<Pubkey> {
    Pubkey::from_str(value.trim())
        .map_err(|e| OrchestratorError::Config(format!("{key}: invalid pubkey {value:?}: {e}")))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> OrchestratorResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| OrchestratorError::Config(format!("{key}={v:?}: {e}"))),
        None => Ok(default),
    }
}

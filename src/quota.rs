//! Per-day, per-provider call budget (§4.3).

use std::sync::Arc;

use chrono::{Duration, Utc};
use chrono_tz::US::Pacific;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::kv::KvStore;

const WARNING_THRESHOLD: f64 = 0.80;
const CRITICAL_THRESHOLD: f64 = 0.95;
const CRITICAL_MAX_CALL_UNITS: u32 = 2;
const KV_TTL: Duration = Duration::hours(48);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuotaRecord {
    used: u32,
    date: String,
    last_updated: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub used: u32,
    pub remaining: u32,
    pub percent_used: f64,
    pub is_warning: bool,
    pub is_critical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaDenied {
    pub allowed: bool,
    pub reason: Option<String>,
}

pub struct QuotaTracker {
    kv: Arc<dyn KvStore>,
    provider: String,
    daily_cap: u32,
}

impl QuotaTracker {
    pub fn new(kv: Arc<dyn KvStore>, provider: &str, daily_cap: u32) -> Self {
        Self {
            kv,
            provider: provider.to_string(),
            daily_cap,
        }
    }

    /// `quota:<provider>:<YYYY-MM-DD-in-provider-tz>`. Pacific is the tz for
    /// the primary integration; a multi-tz deployment would parameterize this.
    fn key_for_date(&self, date: &str) -> String {
        format!("quota:{}:{}", self.provider, date)
    }

    fn today_pacific() -> String {
        Utc::now().with_timezone(&Pacific).format("%Y-%m-%d").to_string()
    }

    fn load(&self) -> Result<QuotaRecord, IngestError> {
        let today = Self::today_pacific();
        let key = self.key_for_date(&today);
        match self.kv.get(&key)? {
            Some(raw) => {
                let mut record: QuotaRecord = serde_json::from_str(&raw)?;
                // Reconcile: if the stored date field lags (tz edge case with a
                // still-live TTL key), roll it and reset usage for the new day.
                if record.date != today {
                    record = QuotaRecord {
                        used: 0,
                        date: today,
                        last_updated: Utc::now().to_rfc3339(),
                    };
                }
                Ok(record)
            }
            None => Ok(QuotaRecord {
                used: 0,
                date: today,
                last_updated: Utc::now().to_rfc3339(),
            }),
        }
    }

    fn save(&self, record: &QuotaRecord) -> Result<(), IngestError> {
        let key = self.key_for_date(&record.date);
        let expires_at = Utc::now() + KV_TTL;
        self.kv.set(&key, &serde_json::to_string(record)?, expires_at)
    }

    fn status_from(&self, record: &QuotaRecord) -> QuotaStatus {
        let percent_used = if self.daily_cap == 0 {
            1.0
        } else {
            record.used as f64 / self.daily_cap as f64
        };
        QuotaStatus {
            used: record.used,
            remaining: self.daily_cap.saturating_sub(record.used),
            percent_used,
            is_warning: percent_used >= WARNING_THRESHOLD,
            is_critical: percent_used >= CRITICAL_THRESHOLD,
        }
    }

    /// Read-only. On date rollover returns a fresh, empty status for the new day.
    pub fn get_status(&self) -> Result<QuotaStatus, IngestError> {
        let record = self.load()?;
        Ok(self.status_from(&record))
    }

    /// `canUse(units)`. Denies if it would push usage above the cap; at
    /// critical, denies any call costing more than `CRITICAL_MAX_CALL_UNITS`.
    pub fn can_use(&self, units: u32) -> Result<QuotaDenied, IngestError> {
        let record = self.load()?;
        let status = self.status_from(&record);

        if status.is_critical && units > CRITICAL_MAX_CALL_UNITS {
            return Ok(QuotaDenied {
                allowed: false,
                reason: Some(format!(
                    "quota critical ({:.0}% used); call costing {units} units exceeds the {CRITICAL_MAX_CALL_UNITS}-unit critical ceiling"
                )),
            });
        }

        if record.used + units > self.daily_cap {
            return Ok(QuotaDenied {
                allowed: false,
                reason: Some(format!(
                    "would exceed daily cap: {} + {units} > {}",
                    record.used, self.daily_cap
                )),
            });
        }

        Ok(QuotaDenied { allowed: true, reason: None })
    }

    /// Roll the date if needed, add `units`, persist, return the new status.
    pub fn track(&self, units: u32) -> Result<QuotaStatus, IngestError> {
        let mut record = self.load()?;
        record.used += units;
        record.last_updated = Utc::now().to_rfc3339();
        self.save(&record)?;
        Ok(self.status_from(&record))
    }

    /// Assert via `can_use`, run `f`, then `track`. If the pre-check fails,
    /// raises `QuotaExhausted` without calling `f`.
    pub async fn with_tracking<T, Fut>(
        &self,
        units: u32,
        f: impl FnOnce() -> Fut,
    ) -> Result<T, IngestError>
    where
        Fut: std::future::Future<Output = Result<T, IngestError>>,
    {
        let check = self.can_use(units)?;
        if !check.allowed {
            return Err(IngestError::QuotaExhausted(
                check.reason.unwrap_or_else(|| "quota exhausted".into()),
            ));
        }
        let result = f().await?;
        self.track(units)?;
        Ok(result)
    }

    /// How many `units`-costing calls can we safely make this cycle without
    /// crossing the daily cap? Lets the scheduler batch-plan (§4.3 rationale).
    pub fn calculate_safe_batch_size(&self, units_per_call: u32) -> Result<u32, IngestError> {
        if units_per_call == 0 {
            return Ok(u32::MAX);
        }
        let status = self.get_status()?;
        Ok(status.remaining / units_per_call)
    }
}

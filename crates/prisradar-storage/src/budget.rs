//! Daily admission control for external scrape calls.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use prisradar_core::Budget;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Store, StoreError};

pub const DEFAULT_DAILY_BUDGET: i32 = 133;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("insufficient scrape budget: requested {requested}, remaining {remaining}")]
    Insufficient { requested: i32, remaining: i32 },
    #[error("allocation amount must be positive, got {0}")]
    InvalidAmount(i32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub granted: i32,
    pub budget: Budget,
}

/// Sole writer of the daily budget row.
///
/// Allocation is serialized through an in-process gate and then applied with a
/// conditional spend in the store, so neither concurrent tasks nor separate
/// processes can push `used` past `total`.
///
/// A day found with nothing left stays closed for this allocator until the
/// date changes or `reset` is called; later allocations are denied without a
/// store round trip.
pub struct BudgetAllocator {
    store: Arc<dyn Store>,
    daily_total: i32,
    gate: Mutex<()>,
    /// Day number (`num_days_from_ce`) known to be exhausted, 0 for none.
    exhausted_day: AtomicI32,
}

impl std::fmt::Debug for BudgetAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetAllocator")
            .field("daily_total", &self.daily_total)
            .finish_non_exhaustive()
    }
}

impl BudgetAllocator {
    pub fn new(store: Arc<dyn Store>, daily_total: i32) -> Self {
        Self {
            store,
            daily_total: daily_total.max(0),
            gate: Mutex::new(()),
            exhausted_day: AtomicI32::new(0),
        }
    }

    pub fn daily_total(&self) -> i32 {
        self.daily_total
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Whether today's budget has been seen exhausted.
    pub fn exhausted_today(&self) -> bool {
        self.exhausted_on(Self::today())
    }

    pub fn exhausted_on(&self, date: NaiveDate) -> bool {
        self.exhausted_day.load(Ordering::Acquire) == date.num_days_from_ce()
    }

    fn note_remaining(&self, date: NaiveDate, remaining: i32) {
        if remaining > 0 {
            return;
        }
        let day = date.num_days_from_ce();
        if self.exhausted_day.swap(day, Ordering::AcqRel) != day {
            info!(%date, "scrape budget exhausted for the day");
        }
    }

    pub async fn get(&self) -> Result<Budget, BudgetError> {
        self.get_on(Self::today()).await
    }

    pub async fn get_on(&self, date: NaiveDate) -> Result<Budget, BudgetError> {
        Ok(self.store.get_or_create_budget(date, self.daily_total).await?)
    }

    pub async fn allocate(&self, amount: i32) -> Result<Allocation, BudgetError> {
        self.allocate_on(Self::today(), amount).await
    }

    pub async fn allocate_on(&self, date: NaiveDate, amount: i32) -> Result<Allocation, BudgetError> {
        if amount <= 0 {
            return Err(BudgetError::InvalidAmount(amount));
        }

        if self.exhausted_on(date) {
            return Err(BudgetError::Insufficient {
                requested: amount,
                remaining: 0,
            });
        }

        let _gate = self.gate.lock().await;
        let current = self.store.get_or_create_budget(date, self.daily_total).await?;
        if let Err(denied) = current.allocate(amount) {
            debug!(requested = amount, remaining = denied.remaining, "scrape budget denied");
            self.note_remaining(date, denied.remaining);
            return Err(BudgetError::Insufficient {
                requested: denied.requested,
                remaining: denied.remaining,
            });
        }

        match self.store.try_spend_budget(date, amount).await? {
            Some(budget) => {
                debug!(granted = amount, remaining = budget.remaining, "scrape budget allocated");
                Ok(Allocation {
                    granted: amount,
                    budget,
                })
            }
            None => {
                // Another process spent the remainder between our read and write.
                let latest = self.store.get_or_create_budget(date, self.daily_total).await?;
                warn!(requested = amount, remaining = latest.remaining, "scrape budget lost a race");
                self.note_remaining(date, latest.remaining);
                Err(BudgetError::Insufficient {
                    requested: amount,
                    remaining: latest.remaining,
                })
            }
        }
    }

    pub async fn reset(&self) -> Result<Budget, BudgetError> {
        self.reset_on(Self::today()).await
    }

    pub async fn reset_on(&self, date: NaiveDate) -> Result<Budget, BudgetError> {
        let _gate = self.gate.lock().await;
        let budget = self.store.reset_budget(date, self.daily_total).await?;
        self.exhausted_day.store(0, Ordering::Release);
        info!(%date, total = budget.total, "scrape budget reset");
        Ok(budget)
    }

    /// Answers an admission request. Denied allocations are a normal `ok: false`
    /// response, store failures and invalid amounts are errors.
    pub async fn handle(&self, request: AdmissionRequest) -> Result<AdmissionResponse, BudgetError> {
        match request.action {
            AdmissionAction::Get => {
                let budget = self.get().await?;
                Ok(AdmissionResponse::feasible(budget))
            }
            AdmissionAction::Allocate => match self.allocate(request.amount.unwrap_or(1)).await {
                Ok(allocation) => Ok(AdmissionResponse::feasible(allocation.budget)),
                Err(BudgetError::Insufficient { .. }) => {
                    let budget = self.get().await?;
                    Ok(AdmissionResponse {
                        ok: false,
                        can_scrape: budget.can_scrape(),
                        budget,
                    })
                }
                Err(err) => Err(err),
            },
            AdmissionAction::Reset => {
                let budget = self.reset().await?;
                Ok(AdmissionResponse::feasible(budget))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionAction {
    Get,
    Allocate,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub action: AdmissionAction,
    #[serde(default)]
    pub amount: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub ok: bool,
    pub can_scrape: bool,
    pub budget: Budget,
}

impl AdmissionResponse {
    fn feasible(budget: Budget) -> Self {
        Self {
            ok: true,
            can_scrape: budget.can_scrape(),
            budget,
        }
    }
}

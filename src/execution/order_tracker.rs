use parking_lot::Mutex;
use std::collections::HashMap;

use super::gateway::{GatewayError, OrderHandle};

/// Why an admission was refused at insert time
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitRejection {
    CapReached { in_flight: usize, cap: usize },
    AlreadyInFlight,
}

#[derive(Debug)]
pub enum Admission {
    Admitted {
        handle: OrderHandle,
        /// Identifiers with an active order, including this one
        in_flight: usize,
        /// The identifier already had an active order (averaging)
        averaged: bool,
    },
    Rejected(AdmitRejection),
    Failed(GatewayError),
}

/// Concurrency-bounded map from identifier to in-flight order handles
///
/// Every handle submitted for an identifier is kept, so averaging orders
/// stay cancellable. The cap counts identifiers with at least one active
/// handle. Completed handles stay in the table until [`OrderTracker::sweep`]
/// reclaims them.
#[derive(Debug, Default)]
pub struct OrderTracker {
    entries: Mutex<HashMap<String, Vec<OrderHandle>>>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifiers with at least one still-active order
    pub fn active_len(&self) -> usize {
        count_active(&self.entries.lock())
    }

    /// Identifiers present in the table, swept or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Check if the identifier has an active order
    pub fn contains(&self, ticker: &str) -> bool {
        self.entries
            .lock()
            .get(ticker)
            .is_some_and(|handles| handles.iter().any(OrderHandle::is_active))
    }

    /// Atomically check the cap, submit, and record the handle
    ///
    /// The lock is held across `submit`, so two concurrent admissions can
    /// never both see room for the last slot. `submit` receives whether the
    /// identifier already has an active order and must not block.
    pub fn admit<F>(&self, ticker: &str, cap: usize, allow_averaging: bool, submit: F) -> Admission
    where
        F: FnOnce(bool) -> Result<OrderHandle, GatewayError>,
    {
        let mut entries = self.entries.lock();

        let in_flight = count_active(&entries);
        if in_flight >= cap {
            return Admission::Rejected(AdmitRejection::CapReached { in_flight, cap });
        }

        let averaged = entries
            .get(ticker)
            .is_some_and(|handles| handles.iter().any(OrderHandle::is_active));
        if averaged && !allow_averaging {
            return Admission::Rejected(AdmitRejection::AlreadyInFlight);
        }

        let handle = match submit(averaged) {
            Ok(handle) => handle,
            Err(e) => return Admission::Failed(e),
        };

        entries
            .entry(ticker.to_string())
            .or_default()
            .push(handle.clone());

        let in_flight = count_active(&entries);
        tracing::debug!(ticker = %ticker, in_flight, cap, averaged, "Order tracked");

        Admission::Admitted {
            handle,
            in_flight,
            averaged,
        }
    }

    /// Remove every completed handle, dropping identifiers left empty
    ///
    /// Returns the handles that were reclaimed.
    pub fn sweep(&self) -> Vec<OrderHandle> {
        let mut entries = self.entries.lock();
        let mut reclaimed = Vec::new();

        entries.retain(|_, handles| {
            let (done, active): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(|h| !h.is_active());
            reclaimed.extend(done);
            *handles = active;
            !handles.is_empty()
        });

        if !reclaimed.is_empty() {
            tracing::debug!(
                reclaimed = reclaimed.len(),
                remaining = entries.len(),
                "Swept completed orders"
            );
        }

        reclaimed
    }

    /// Take every handle out of the table, leaving it empty
    ///
    /// Callers iterate the returned snapshot, never the live map.
    pub fn drain(&self) -> Vec<OrderHandle> {
        self.entries
            .lock()
            .drain()
            .flat_map(|(_, handles)| handles)
            .collect()
    }

    /// Copy of the table for reporting
    pub fn snapshot(&self) -> Vec<(String, Vec<OrderHandle>)> {
        let mut rows: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(ticker, handles)| (ticker.clone(), handles.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

fn count_active(entries: &HashMap<String, Vec<OrderHandle>>) -> usize {
    entries
        .values()
        .filter(|handles| handles.iter().any(OrderHandle::is_active))
        .count()
}

//! Application rescale planner
//!
//! An application request is split into bounded steps, and every step goes
//! to the member container that fits it best. Planning is speculative: it
//! never talks to host agents and never touches cached host entries. The
//! outcome is one new pending request per chosen container, applied later by
//! the container executor.

use super::{HostCache, RescaleError};
use crate::models::{Placement, Request, ResourceKind, Structure, ValidationError};
use crate::store::StateStore;
use std::collections::BTreeMap;
use tracing::warn;

/// Magnitude of a single planning step, in shares
pub const SPLIT_SHARES: i64 = 15;

/// Planner view of one member container
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub placement: Placement,
    pub current: i64,
    pub usage: f64,
    pub min: i64,
    pub max: i64,
}

impl Candidate {
    pub fn from_structure(container: &Structure, resource: ResourceKind) -> Result<Self, ValidationError> {
        let bounds = container.bounds(resource)?;
        Ok(Self {
            name: container.name.clone(),
            placement: container.placement()?,
            current: container.current(resource)?,
            usage: container.resource(resource)?.usage.unwrap_or(0.0),
            min: bounds.min,
            max: bounds.max,
        })
    }

    /// Granted shares the container is not using
    pub fn margin(&self) -> f64 {
        self.current as f64 - self.usage
    }

    fn fits(&self, step: i64, host_free: &BTreeMap<String, i64>) -> bool {
        if step < 0 {
            self.current >= -step && self.current + step >= self.min
        } else {
            let host_fits = host_free
                .get(&self.placement.host)
                .map_or(true, |free| *free >= step);
            host_fits && self.current + step <= self.max
        }
    }
}

/// Result of planning one application request
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub requested: i64,
    pub rescaled: i64,
    /// One coalesced request per chosen container, in first-chosen order
    pub requests: Vec<Request>,
}

impl Plan {
    pub fn is_complete(&self) -> bool {
        self.rescaled == self.requested
    }
}

/// Split `amount` into steps of `split` shares plus a final remainder
pub fn split_amount(amount: i64, split: i64) -> Vec<i64> {
    let split = split.max(1);
    let step = split * amount.signum();
    let mut steps = Vec::new();
    let mut remaining = amount;
    while remaining.abs() > split {
        steps.push(step);
        remaining -= step;
    }
    if remaining != 0 {
        steps.push(remaining);
    }
    steps
}

/// Index of the container that should take `step`
///
/// Scaling up helps the container with the smallest margin, scaling down
/// takes from the one with the largest. Ties keep the earlier container.
pub fn best_fit(candidates: &[Candidate], step: i64, host_free: &BTreeMap<String, i64>) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if !candidate.fits(step, host_free) {
            continue;
        }
        best = match best {
            None => Some(index),
            Some(current) => {
                let better = if step < 0 {
                    candidate.margin() > candidates[current].margin()
                } else {
                    candidate.margin() < candidates[current].margin()
                };
                Some(if better { index } else { current })
            }
        };
    }
    best
}

/// Distribute `amount` of `resource` over `candidates`
///
/// `host_free` holds the free capacity of every host that tracks it; hosts
/// missing from it do not limit scale-ups.
pub fn plan(
    resource: ResourceKind,
    amount: i64,
    candidates: Vec<Candidate>,
    mut host_free: BTreeMap<String, i64>,
    split: i64,
    timestamp: i64,
) -> Plan {
    let mut order = candidates;
    let mut chosen: Vec<(String, Placement, i64)> = Vec::new();
    let mut rescaled = 0;

    for step in split_amount(amount, split) {
        let Some(index) = best_fit(&order, step, &host_free) else {
            break;
        };
        let mut candidate = order.remove(index);
        candidate.current += step;
        if step > 0 {
            if let Some(free) = host_free.get_mut(&candidate.placement.host) {
                *free -= step;
            }
        }

        match chosen.iter_mut().find(|(name, _, _)| *name == candidate.name) {
            Some((_, _, total)) => *total += step,
            None => chosen.push((candidate.name.clone(), candidate.placement.clone(), step)),
        }
        rescaled += step;
        order.push(candidate);
    }

    let requests = chosen
        .into_iter()
        .map(|(name, placement, total)| Request::new(name, resource, total, &placement, timestamp))
        .collect();

    Plan {
        requested: amount,
        rescaled,
        requests,
    }
}

/// Fans application requests out over member containers
pub struct ApplicationPlanner<'a> {
    store: &'a dyn StateStore,
    split: i64,
    debug: bool,
}

impl<'a> ApplicationPlanner<'a> {
    pub fn new(store: &'a dyn StateStore, split: i64, debug: bool) -> Self {
        Self { store, split, debug }
    }

    /// Plan `request` over the members of `application` and store the
    /// resulting container requests
    pub async fn rescale(
        &self,
        request: &Request,
        application: &Structure,
        cache: &mut HostCache,
    ) -> Result<Plan, RescaleError> {
        if request.amount == 0 {
            verbose!(self.debug, application = %application.name, "Empty request, nothing to do");
            return Ok(Plan {
                requested: 0,
                rescaled: 0,
                requests: Vec::new(),
            });
        }

        let (candidates, host_free) = self
            .candidates(application, request.resource, cache)
            .await?;
        let timestamp = chrono::Utc::now().timestamp();
        let plan = plan(
            request.resource,
            request.amount,
            candidates,
            host_free,
            self.split,
            timestamp,
        );

        for generated in &plan.requests {
            self.store.add_request(generated).await?;
        }

        verbose!(
            self.debug,
            application = %application.name,
            containers = ?plan.requests.iter().map(|r| r.structure.as_str()).collect::<Vec<_>>(),
            rescaled = plan.rescaled,
            requested = plan.requested,
            "Application rescale planned"
        );
        Ok(plan)
    }

    /// Load the members of `application` and the free capacity of their hosts
    async fn candidates(
        &self,
        application: &Structure,
        resource: ResourceKind,
        cache: &mut HostCache,
    ) -> Result<(Vec<Candidate>, BTreeMap<String, i64>), RescaleError> {
        let mut candidates = Vec::with_capacity(application.containers.len());
        let mut host_free = BTreeMap::new();

        for name in &application.containers {
            let container = match self.store.get_structure(name).await {
                Ok(container) => container,
                Err(e) if e.is_not_found() => {
                    warn!(application = %application.name, container = %name, "Member container not found, skipping");
                    continue;
                }
                Err(e) if e.is_malformed() => {
                    warn!(application = %application.name, container = %name, error = %e, "Member container is malformed, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let candidate = match Candidate::from_structure(&container, resource) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(application = %application.name, container = %name, error = %e, "Skipping member container");
                    continue;
                }
            };

            let host = match cache.load(self.store, &candidate.placement.host).await {
                Ok(host) => host,
                Err(e) if e.is_not_found() => {
                    warn!(container = %name, host = %candidate.placement.host, "Host not found, skipping container");
                    continue;
                }
                Err(e) if e.is_malformed() => {
                    warn!(container = %name, host = %candidate.placement.host, error = %e, "Host is malformed, skipping container");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match host.resources.get(&resource).and_then(|r| r.free) {
                Some(free) => {
                    host_free.insert(host.name.clone(), free);
                }
                None if resource.requires_host_capacity() => {
                    warn!(container = %name, host = %host.name, resource = %resource, "Host has no capacity record, skipping container");
                    continue;
                }
                None => {}
            }
            candidates.push(candidate);
        }

        Ok((candidates, host_free))
    }
}

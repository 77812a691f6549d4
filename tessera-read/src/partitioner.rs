//! The subarray partitioner.
//!
//! Turns a user subarray into a stream of sub-regions whose estimated
//! result fits the caller's buffer budgets. Pending sub-regions live in a
//! deque seeded with the full subarray; a region whose estimate exceeds a
//! budget is split in two and both halves go back to the front, so the
//! stream stays in traversal order.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;
use rustc_hash::FxHashMap;
use tessera_core::{ArraySchema, CoordType, FragmentMetadata, MemoryBudget, Subarray};
use tessera_error::{tessera_bail, TesseraResult};

use crate::estimate::{est_read_buffer_sizes, no_estimated_results};

#[derive(Debug, Clone, Copy)]
struct AttrBudget {
    fixed: u64,
    var: u64,
}

#[derive(Debug)]
pub struct SubarrayPartitioner<T: CoordType> {
    schema: Arc<ArraySchema<T>>,
    fragments: Vec<Arc<FragmentMetadata<T>>>,
    sparse_mode: bool,
    pending: VecDeque<Subarray<T>>,
    current: Option<Subarray<T>>,
    started: bool,
    unsplittable: bool,
    budgets: FxHashMap<String, AttrBudget>,
    memory_budget: MemoryBudget,
}

impl<T: CoordType> SubarrayPartitioner<T> {
    pub fn new(
        schema: Arc<ArraySchema<T>>,
        fragments: Vec<Arc<FragmentMetadata<T>>>,
        subarray: Subarray<T>,
        sparse_mode: bool,
    ) -> Self {
        let mut pending = VecDeque::new();
        pending.push_back(subarray);
        Self {
            schema,
            fragments,
            sparse_mode,
            pending,
            current: None,
            started: false,
            unsplittable: false,
            budgets: FxHashMap::default(),
            memory_budget: MemoryBudget {
                fixed: u64::MAX,
                var: u64::MAX,
            },
        }
    }

    /// Budget the fixed stream of `attr`.
    pub fn set_result_budget(&mut self, attr: &str, bytes: u64) -> TesseraResult<()> {
        if self.schema.var_size(attr)? {
            tessera_bail!(VarLengthMismatch: "attribute '{attr}' is var-sized");
        }
        self.budgets.insert(
            attr.to_owned(),
            AttrBudget {
                fixed: bytes,
                var: 0,
            },
        );
        Ok(())
    }

    /// Budget both streams of a var-sized `attr`.
    pub fn set_result_budget_var(
        &mut self,
        attr: &str,
        offsets_bytes: u64,
        var_bytes: u64,
    ) -> TesseraResult<()> {
        if !self.schema.var_size(attr)? {
            tessera_bail!(VarLengthMismatch: "attribute '{attr}' is fixed-size");
        }
        self.budgets.insert(
            attr.to_owned(),
            AttrBudget {
                fixed: offsets_bytes,
                var: var_bytes,
            },
        );
        Ok(())
    }

    /// Cap the tile bytes a sub-region may keep in flight.
    pub fn set_memory_budget(&mut self, fixed: u64, var: u64) {
        self.memory_budget = MemoryBudget { fixed, var };
    }

    pub fn current(&self) -> Option<&Subarray<T>> {
        self.current.as_ref()
    }

    /// Whether the current sub-region cannot be split any further.
    pub fn unsplittable(&self) -> bool {
        self.unsplittable
    }

    /// Clear the unsplittable flag once the current sub-region has been
    /// emitted despite it, so the next call advances normally.
    pub fn clear_unsplittable(&mut self) {
        self.unsplittable = false;
    }

    /// Drop all pending sub-regions and mark the stream exhausted.
    pub fn finish(&mut self) {
        self.pending.clear();
        self.current = None;
        self.started = true;
        self.unsplittable = false;
    }

    /// Whether the stream is exhausted.
    pub fn done(&self) -> bool {
        self.started && self.current.is_none()
    }

    /// Advance to the next sub-region whose estimate fits the budgets,
    /// skipping regions estimated to produce nothing.
    pub fn next(&mut self) -> TesseraResult<Option<&Subarray<T>>> {
        self.started = true;
        self.unsplittable = false;
        while let Some(candidate) = self.pending.pop_front() {
            let (est, memory) = est_read_buffer_sizes(
                &self.schema,
                &self.fragments,
                &candidate,
                &self.budget_attrs(),
                self.sparse_mode,
            )?;

            if no_estimated_results(&est) {
                continue;
            }

            let fits_result = est.iter().all(|(attr, e)| {
                self.budgets
                    .get(attr)
                    .is_none_or(|b| e.fixed <= b.fixed && e.var <= b.var)
            });
            let fits_memory =
                memory.fixed <= self.memory_budget.fixed && memory.var <= self.memory_budget.var;

            if fits_result && fits_memory {
                self.current = Some(candidate);
                return Ok(self.current.as_ref());
            }

            match candidate.split(self.schema.domain()) {
                Some((left, right)) => {
                    self.pending.push_front(right);
                    self.pending.push_front(left);
                }
                None => {
                    if !fits_memory {
                        tessera_bail!(
                            MemoryBudgetExceeded: "a single tile needs {} fixed / {} var bytes",
                            memory.fixed,
                            memory.var
                        );
                    }
                    // The caller still processes a single-cell region, and
                    // reports overflow to the user if it does not fit.
                    trace!("unsplittable single-cell sub-region");
                    self.unsplittable = true;
                    self.current = Some(candidate);
                    return Ok(self.current.as_ref());
                }
            }
        }
        self.current = None;
        Ok(None)
    }

    /// Split the current sub-region after the caller observed an overflow;
    /// leaves it in place and flags `unsplittable` when it cannot shrink.
    pub fn split_current(&mut self) -> TesseraResult<()> {
        let Some(current) = self.current.take() else {
            tessera_bail!("split_current without a current sub-region");
        };
        match current.split(self.schema.domain()) {
            Some((left, right)) => {
                self.pending.push_front(right);
                self.pending.push_front(left);
                self.next()?;
            }
            None => {
                self.unsplittable = true;
                self.current = Some(current);
            }
        }
        Ok(())
    }

    fn budget_attrs(&self) -> Vec<String> {
        self.budgets.keys().cloned().collect()
    }
}

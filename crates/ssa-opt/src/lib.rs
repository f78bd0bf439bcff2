//! # SSA-Opt
//!
//! Analyses and optimization passes over the `ssa-core` IR:
//!
//! - Dominator and post-dominator trees, a loop forest with canonical-form
//!   queries, a scalar-evolution analysis restricted to affine
//!   add-recurrences, and a conservative memory-dependence oracle
//! - `LocalOpts`: per-block peephole simplification of binary integer
//!   operations with a dead-code sweep
//! - `LoopOpts`: loop-invariant code motion into the preheader
//! - `LoopFusion`: merging adjacent, control-equivalent, equally counted
//!   sibling loops
//!
//! Passes mutate the IR in place and report whether the analyses computed
//! before the run are still valid. A pass that cannot prove its
//! preconditions declines and leaves the function untouched.

pub mod cfg;
pub mod depend;
pub mod domtree;
pub mod local_opts;
pub mod loop_fusion;
pub mod loop_info;
pub mod loop_opts;
pub mod scev;

pub use depend::DependenceInfo;
pub use domtree::{DominatorTree, PostDominatorTree};
pub use local_opts::LocalOpts;
pub use loop_fusion::LoopFusion;
pub use loop_info::{Loop, LoopInfo};
pub use loop_opts::LoopOpts;
pub use scev::{AddRec, ScalarEvolution, Scev};

use ssa_core::{Function, Module};

/// Which of the analyses computed before a pass remain valid after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreservedAnalyses {
    /// Nothing was mutated; every analysis is still valid
    All,
    /// The IR changed; recompute before relying on any analysis
    None,
}

/// Base trait for all passes
pub trait Pass {
    /// The name of this pass
    fn name(&self) -> &'static str;
}

/// A pass operating on an entire module
pub trait ModulePass: Pass {
    fn run_on_module(&mut self, module: &mut Module) -> PreservedAnalyses;
}

/// A pass operating on a single function
pub trait FunctionPass: Pass {
    fn run_on_function(
        &mut self,
        f: &mut Function,
        analyses: &FunctionAnalyses,
    ) -> PreservedAnalyses;
}

/// A pass operating on one loop of a function's forest
pub trait LoopPass: Pass {
    fn run_on_loop(
        &mut self,
        f: &mut Function,
        loop_info: &LoopInfo,
        loop_id: usize,
        domtree: &DominatorTree,
    ) -> PreservedAnalyses;
}

/// The read-only analysis bundle handed to function passes
pub struct FunctionAnalyses {
    pub domtree: DominatorTree,
    pub postdomtree: PostDominatorTree,
    pub loop_info: LoopInfo,
    pub scev: ScalarEvolution,
    pub depinfo: DependenceInfo,
}

impl FunctionAnalyses {
    /// Compute every analysis for a function
    pub fn compute(f: &Function) -> Self {
        let domtree = DominatorTree::compute(f);
        let loop_info = LoopInfo::compute(f, &domtree);
        Self {
            postdomtree: PostDominatorTree::compute(f),
            loop_info,
            domtree,
            scev: ScalarEvolution::new(),
            depinfo: DependenceInfo::new(),
        }
    }
}

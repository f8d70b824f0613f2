//! Wire messages of the distributed search.
//!
//! Every exchange between agents is one of these tagged values; receivers
//! multiplex on the sender and the payload discriminant. The semantic
//! contract matters, not the encoding: the in-process transport moves the
//! values as-is, a networked transport would serialize them.

use concord_comm::{AgentId, CommError, Transport};
use concord_planning::dtg::DtgEdge;
use concord_planning::{CausalLink, Fact, Step, StepId, ValId, VarId};
use serde::{Deserialize, Serialize};

/// Plans are identified across agents by their deterministic name, never by
/// local arena ids.
pub type PlanName = String;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    /// Start-up: transition edges of shareable variables.
    DtgEdges(Vec<DtgEdge>),
    /// Start-up: newly reached shareable facts of one relaxed-graph layer.
    RpgLayer(RpgLayerMsg),
    /// Landmark-graph construction traffic.
    Landmark(LandmarkMsg),
    /// Global landmark id assignment round.
    GlobalIds(GlobalIdMsg),
    /// Ids of single, non-initial, non-goal landmarks private to the sender.
    LandmarkSharing(LandmarkSharingMsg),
    /// Necessary-ordering post-processing traffic.
    PostProcessing(PostProcessingMsg),
    /// Base-plan announcement opening an outer iteration.
    NewBasePlan(NewBasePlanMsg),
    /// One agent's refinements of the current base plan.
    Proposals(ProposalsMsg),
    /// Heuristic deltas and votes, collected by the next baton holder.
    Adjustments(AdjustmentMsg),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PayloadKind {
    DtgEdges,
    RpgLayer,
    Landmark,
    GlobalIds,
    LandmarkSharing,
    PostProcessing,
    NewBasePlan,
    Proposals,
    Adjustments,
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::DtgEdges(_) => PayloadKind::DtgEdges,
            Payload::RpgLayer(_) => PayloadKind::RpgLayer,
            Payload::Landmark(_) => PayloadKind::Landmark,
            Payload::GlobalIds(_) => PayloadKind::GlobalIds,
            Payload::LandmarkSharing(_) => PayloadKind::LandmarkSharing,
            Payload::PostProcessing(_) => PayloadKind::PostProcessing,
            Payload::NewBasePlan(_) => PayloadKind::NewBasePlan,
            Payload::Proposals(_) => PayloadKind::Proposals,
            Payload::Adjustments(_) => PayloadKind::Adjustments,
        }
    }
}

/// Blocks until a payload of the given kind arrives from `from`; anything
/// else is left for later receives.
pub fn recv_kind<T: Transport<Payload>>(
    transport: &mut T,
    from: AgentId,
    kind: PayloadKind,
) -> Result<Payload, CommError> {
    transport
        .recv_matching(&mut |env| env.sender == from && env.payload.kind() == kind)
        .map(|env| env.payload)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpgLayerMsg {
    pub facts: Vec<Fact>,
}

/// Identity of a landmark across agents: its variable plus the sorted member
/// values. A single landmark has exactly one member.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct LandmarkLabel {
    pub var: VarId,
    pub vals: Vec<ValId>,
}

impl LandmarkLabel {
    pub fn single(fact: Fact) -> LandmarkLabel {
        LandmarkLabel {
            var: fact.var,
            vals: vec![fact.val],
        }
    }

    pub fn disjunction(var: VarId, mut vals: Vec<ValId>) -> LandmarkLabel {
        vals.sort();
        vals.dedup();
        LandmarkLabel { var, vals }
    }

    pub fn is_single(&self) -> bool {
        self.vals.len() == 1
    }

    pub fn facts(&self) -> impl Iterator<Item = Fact> + '_ {
        let var = self.var;
        self.vals.iter().map(move |&val| Fact { var, val })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LandmarkMsg {
    /// Baton opens a candidate round.
    Candidate { label: LandmarkLabel },
    /// Participant answer: preconditions common to all local producers, plus
    /// the some-but-not-all ones grouped by variable.
    CommonPrecs {
        common: Vec<Fact>,
        disjunctions: Vec<(VarId, Vec<ValId>)>,
    },
    /// Participant answer when no local action produces the candidate.
    NoProducer,
    /// Baton broadcast of the cross-agent intersection. Every agent runs the
    /// promotion rule on it locally (the verification stage).
    Verification {
        singles: Vec<Fact>,
        disjunctions: Vec<(VarId, Vec<ValId>)>,
    },
    /// Baton has no candidate left at this level; the next agent takes over.
    PassBaton,
    /// Every agent exhausted the current level.
    ChangeLevel { next: u32 },
    /// Extraction finished; post-processing starts.
    EndProcedure,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalIdMsg {
    pub assignments: Vec<(LandmarkLabel, u32)>,
    /// Value of the travelling counter after this agent's assignments.
    pub counter: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LandmarkSharingMsg {
    pub ids: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PostProcessingMsg {
    /// Edges this agent proved non-necessary on its own relaxed graph.
    Verdicts {
        removable: Vec<(LandmarkLabel, LandmarkLabel)>,
    },
    /// Baton union: edges every agent must drop.
    Remove {
        edges: Vec<(LandmarkLabel, LandmarkLabel)>,
    },
}

/// A refinement shipped to the other agents: parent reference plus the delta,
/// with the proposer's heuristic evaluation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalWire {
    pub parent: PlanName,
    pub name: PlanName,
    pub step: Option<Step>,
    pub links: Vec<CausalLink>,
    pub orderings: Vec<(StepId, StepId)>,
    pub is_solution: bool,
    pub g: u32,
    pub h_dtg: u32,
    pub h_land: u32,
    /// Global ids of the landmarks achieved by the plan, as the proposer sees
    /// them.
    pub achieved: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalsMsg {
    pub proposals: Vec<ProposalWire>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanAdjustment {
    pub plan: PlanName,
    /// Landmarks the sender recognized as achieved that the proposer missed.
    pub new_landmarks: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdjustmentMsg {
    pub changes: Vec<PlanAdjustment>,
    /// Metric verdicts on this iteration's solution candidates.
    pub votes: Vec<(PlanName, bool)>,
    /// Lowest f-value this agent had to defer (iterative-deepening search).
    pub min_deferred_f: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BaseControl {
    /// Everyone expands this plan.
    Expand { plan: PlanName },
    /// No plan within the bound anywhere; retry with a wider one.
    RaiseBound { bound: u32 },
    /// A solution was accepted; the search is over.
    Solution { plan: PlanName },
    /// Every queue drained: the task has no solution.
    Exhausted,
    /// The cooperative deadline passed.
    Timeout,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewBasePlanMsg {
    pub control: BaseControl,
    /// Merged heuristic deltas, applied by every agent before insertion.
    pub adjustments: Vec<PlanAdjustment>,
}

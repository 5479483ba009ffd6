//! Per-node cook/instantiate pipeline
//!
//! A pipeline run takes one node from "needs cook" to "outputs current":
//!
//! ```text
//! Idle -> [AwaitingUpstream] -> [Instantiating -> Instantiated] -> UploadingParameters
//!      -> [Cooking -> ReadingOutputs] -> Idle
//! ```
//!
//! Any state moves to `Invalid` on session loss, and `Invalid` resets to
//! `Idle` once the node's remote ids are cleared.
//!
//! # Layout
//!
//! - [`CookState`] / [`Signal`] - the states and the pure transition function
//! - [`job`] - blocking remote work that runs on worker threads
//! - [`driver`] - the scheduling-thread side: admission, continuations, upload, finish
//!
//! Worker jobs never touch node or session state. Each job hands back a
//! [`job::Continuation`] which the driver applies on the scheduling thread.

pub mod driver;
pub mod job;

pub use driver::{admit, resume, Dispatch};
pub use job::{Continuation, Job, JobOutput};

/// Pipeline state of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CookState {
    Idle,
    AwaitingUpstream,
    Instantiating,
    Instantiated,
    UploadingParameters,
    Cooking,
    ReadingOutputs,
    Invalid,
}

/// Result of the last step, fed into [`CookState::next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The resolver redirected the cook to an upstream node
    UpstreamPending,
    /// Instantiation was dispatched to a worker
    InstantiateDispatched,
    /// The node is instantiated and current; go straight to upload
    AlreadyInstantiated,
    InstantiateSucceeded,
    /// Parameters and inputs were re-synchronised after instantiation
    ParametersSynced,
    CookDispatched,
    CookSucceeded,
    /// The cook discovered inputs that still need uploading
    NewInputsDiscovered,
    /// The run completed and downstream nodes were notified
    Finished,
    /// A recoverable failure aborted the run
    Failed,
    SessionLost,
    /// Remote ids were cleared after session loss
    Reset,
}

impl CookState {
    /// Transition function. `None` means the signal is not valid here.
    pub fn next(self, signal: Signal) -> Option<CookState> {
        use CookState::*;
        let next = match (self, signal) {
            (_, Signal::SessionLost) => Invalid,
            (Invalid, Signal::Reset) => Idle,

            (Idle | AwaitingUpstream | Instantiated, Signal::UpstreamPending) => AwaitingUpstream,
            (Idle | AwaitingUpstream, Signal::InstantiateDispatched) => Instantiating,
            (Idle | AwaitingUpstream, Signal::AlreadyInstantiated) => UploadingParameters,
            (Instantiating, Signal::InstantiateSucceeded) => Instantiated,
            (Instantiated, Signal::ParametersSynced) => UploadingParameters,
            (UploadingParameters, Signal::CookDispatched) => Cooking,
            (Cooking, Signal::CookSucceeded) => ReadingOutputs,
            (Cooking, Signal::NewInputsDiscovered) => UploadingParameters,
            (UploadingParameters | ReadingOutputs, Signal::Finished) => Idle,

            (Idle | Invalid, Signal::Failed) => return None,
            (_, Signal::Failed) => Idle,

            _ => return None,
        };
        Some(next)
    }

    /// A remote call for this node is in flight
    pub fn is_busy(self) -> bool {
        matches!(self, CookState::Instantiating | CookState::Cooking)
    }
}

/// Free-function form of [`CookState::next`]
pub fn transition(state: CookState, signal: Signal) -> Option<CookState> {
    state.next(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(signals: &[Signal]) -> Vec<CookState> {
        let mut state = CookState::Idle;
        let mut seen = vec![state];
        for signal in signals {
            state = state.next(*signal).expect("valid transition");
            seen.push(state);
        }
        seen
    }

    #[test]
    fn test_fresh_node_with_cook() {
        let seen = run(&[
            Signal::InstantiateDispatched,
            Signal::InstantiateSucceeded,
            Signal::ParametersSynced,
            Signal::CookDispatched,
            Signal::CookSucceeded,
            Signal::Finished,
        ]);
        assert_eq!(
            seen,
            vec![
                CookState::Idle,
                CookState::Instantiating,
                CookState::Instantiated,
                CookState::UploadingParameters,
                CookState::Cooking,
                CookState::ReadingOutputs,
                CookState::Idle,
            ]
        );
    }

    #[test]
    fn test_upload_without_cook() {
        let seen = run(&[Signal::AlreadyInstantiated, Signal::Finished]);
        assert_eq!(seen.last(), Some(&CookState::Idle));
    }

    #[test]
    fn test_extra_round_trip() {
        let seen = run(&[
            Signal::AlreadyInstantiated,
            Signal::CookDispatched,
            Signal::NewInputsDiscovered,
            Signal::CookDispatched,
            Signal::CookSucceeded,
            Signal::Finished,
        ]);
        assert_eq!(seen.iter().filter(|s| **s == CookState::Cooking).count(), 2);
    }

    #[test]
    fn test_session_loss_then_reset() {
        assert_eq!(CookState::Cooking.next(Signal::SessionLost), Some(CookState::Invalid));
        assert_eq!(CookState::Invalid.next(Signal::Reset), Some(CookState::Idle));
        assert_eq!(CookState::Invalid.next(Signal::CookDispatched), None);
    }

    #[test]
    fn test_cannot_cook_from_idle() {
        assert_eq!(CookState::Idle.next(Signal::CookDispatched), None);
        assert_eq!(CookState::Idle.next(Signal::Failed), None);
    }

    fn any_signal() -> impl Strategy<Value = Signal> {
        prop_oneof![
            Just(Signal::UpstreamPending),
            Just(Signal::InstantiateDispatched),
            Just(Signal::AlreadyInstantiated),
            Just(Signal::InstantiateSucceeded),
            Just(Signal::ParametersSynced),
            Just(Signal::CookDispatched),
            Just(Signal::CookSucceeded),
            Just(Signal::NewInputsDiscovered),
            Just(Signal::Finished),
            Just(Signal::Failed),
            Just(Signal::SessionLost),
            Just(Signal::Reset),
        ]
    }

    proptest! {
        #[test]
        fn prop_session_loss_always_reaches_invalid(signals in prop::collection::vec(any_signal(), 0..32)) {
            let mut state = CookState::Idle;
            for signal in signals {
                state = state.next(signal).unwrap_or(state);
            }
            prop_assert_eq!(state.next(Signal::SessionLost), Some(CookState::Invalid));
        }

        #[test]
        fn prop_busy_states_only_follow_dispatch(signals in prop::collection::vec(any_signal(), 0..32)) {
            let mut state = CookState::Idle;
            for signal in signals {
                if let Some(next) = state.next(signal) {
                    if next.is_busy() && !state.is_busy() {
                        prop_assert!(matches!(
                            signal,
                            Signal::InstantiateDispatched | Signal::CookDispatched
                        ));
                    }
                    state = next;
                }
            }
        }
    }
}

//! Test flows exercising the runtime's mechanics.
//!
//! Each flow is a deliberately small state machine covering one behavior:
//! session ping-pong, gated suspension for crash injection, idempotent
//! sub-flows, multi-session receives, timed retries, sleeping, and
//! catch-handler semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use ledgerflow::{
    FlowContext, FlowError, FlowIoRequest, FlowLogic, FlowYield, InvocationContext, PeerId,
    ResumeValue, SessionId,
};
use serde::{Deserialize, Serialize};

fn unexpected(resume: &ResumeValue) -> FlowError {
    FlowError::internal(format!("unexpected resume value: {resume:?}"))
}

fn peer_from_args(args: &[u8]) -> Result<PeerId, FlowError> {
    let name = std::str::from_utf8(args)
        .map_err(|_| FlowError::internal("peer name is not valid utf-8"))?;
    Ok(PeerId::new(name))
}

// =============================================================================
// Initiator: sends "ping", expects one reply, returns it.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum PingFlow {
    Starting { peer: PeerId },
    AwaitingSession,
    AwaitingReply { session: SessionId },
}

impl FlowLogic for PingFlow {
    const NAME: &'static str = "ping-pong";

    fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
        Ok(PingFlow::Starting {
            peer: peer_from_args(args)?,
        })
    }

    fn advance(
        &mut self,
        _ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            PingFlow::Starting { peer } => {
                let peer = peer.clone();
                *self = PingFlow::AwaitingSession;
                Ok(FlowYield::InitiateSession { peer })
            }
            PingFlow::AwaitingSession => match resume {
                ResumeValue::Session(session) => {
                    *self = PingFlow::AwaitingReply { session };
                    Ok(FlowYield::io(FlowIoRequest::SendAndReceive {
                        sessions: BTreeMap::from([(session, b"ping".to_vec())]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            PingFlow::AwaitingReply { session } => match resume {
                ResumeValue::Payloads(mut payloads) => {
                    let reply = payloads.remove(session).unwrap_or_default();
                    Ok(FlowYield::Finish(reply))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Responder half of the ping-pong protocol.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum PongResponder {
    AwaitingPing,
    Receiving { session: SessionId },
    Replying { session: SessionId },
}

impl FlowLogic for PongResponder {
    const NAME: &'static str = "pong-responder";

    fn start(_invocation: &InvocationContext, _args: &[u8]) -> Result<Self, FlowError> {
        Ok(PongResponder::AwaitingPing)
    }

    fn advance(
        &mut self,
        ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            PongResponder::AwaitingPing => {
                let session = ctx
                    .initial_session
                    .ok_or_else(|| FlowError::internal("responder without initial session"))?;
                *self = PongResponder::Receiving { session };
                Ok(FlowYield::io(FlowIoRequest::Receive {
                    sessions: BTreeSet::from([session]),
                }))
            }
            PongResponder::Receiving { session } => match resume {
                ResumeValue::Payloads(_) => {
                    let session = *session;
                    *self = PongResponder::Replying { session };
                    Ok(FlowYield::io(FlowIoRequest::Send {
                        sessions: BTreeMap::from([(session, b"pong".to_vec())]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            PongResponder::Replying { .. } => match resume {
                ResumeValue::Acknowledged => Ok(FlowYield::Finish(Vec::new())),
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Responder that drives a send-and-receive over its inbound session.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum ExchangeFlow {
    Starting,
    AwaitingReply { session: SessionId },
}

impl FlowLogic for ExchangeFlow {
    const NAME: &'static str = "exchange";

    fn start(_invocation: &InvocationContext, _args: &[u8]) -> Result<Self, FlowError> {
        Ok(ExchangeFlow::Starting)
    }

    fn advance(
        &mut self,
        ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            ExchangeFlow::Starting => {
                let session = ctx
                    .initial_session
                    .ok_or_else(|| FlowError::internal("responder without initial session"))?;
                *self = ExchangeFlow::AwaitingReply { session };
                Ok(FlowYield::io(FlowIoRequest::SendAndReceive {
                    sessions: BTreeMap::from([(session, b"ping".to_vec())]),
                }))
            }
            ExchangeFlow::AwaitingReply { session } => match resume {
                ResumeValue::Payloads(mut payloads) => {
                    let reply = payloads.remove(session).unwrap_or_default();
                    Ok(FlowYield::Finish(reply))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Ping flow gated behind an async operation, for crash injection between
// the gate and the send suspension.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum GatedPingFlow {
    AwaitingGate { peer: PeerId },
    AwaitingSession,
    AwaitingReply { session: SessionId },
}

impl FlowLogic for GatedPingFlow {
    const NAME: &'static str = "gated-ping";

    fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
        Ok(GatedPingFlow::AwaitingGate {
            peer: peer_from_args(args)?,
        })
    }

    fn advance(
        &mut self,
        _ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            GatedPingFlow::AwaitingGate { peer } => match resume {
                ResumeValue::Start => Ok(FlowYield::io(FlowIoRequest::ExecuteAsync {
                    operation: "gate".into(),
                })),
                ResumeValue::AsyncResult(_) => {
                    let peer = peer.clone();
                    *self = GatedPingFlow::AwaitingSession;
                    Ok(FlowYield::InitiateSession { peer })
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            GatedPingFlow::AwaitingSession => match resume {
                ResumeValue::Session(session) => {
                    *self = GatedPingFlow::AwaitingReply { session };
                    Ok(FlowYield::io(FlowIoRequest::SendAndReceive {
                        sessions: BTreeMap::from([(session, b"ping".to_vec())]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            GatedPingFlow::AwaitingReply { session } => match resume {
                ResumeValue::Payloads(mut payloads) => {
                    let reply = payloads.remove(session).unwrap_or_default();
                    Ok(FlowYield::Finish(reply))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Parent flow invoking an idempotent sub-flow that sends.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum NestedFlow {
    Starting { peer: PeerId },
    AwaitingSession,
    Greeting { session: SessionId },
    AwaitingConfirmation { session: SessionId },
    EnteringChild { session: SessionId },
    ChildSending { session: SessionId },
    LeavingChild { session: SessionId },
}

impl FlowLogic for NestedFlow {
    const NAME: &'static str = "nested";

    fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
        Ok(NestedFlow::Starting {
            peer: peer_from_args(args)?,
        })
    }

    fn advance(
        &mut self,
        _ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            NestedFlow::Starting { peer } => {
                let peer = peer.clone();
                *self = NestedFlow::AwaitingSession;
                Ok(FlowYield::InitiateSession { peer })
            }
            NestedFlow::AwaitingSession => match resume {
                ResumeValue::Session(session) => {
                    *self = NestedFlow::Greeting { session };
                    Ok(FlowYield::io(FlowIoRequest::Send {
                        sessions: BTreeMap::from([(session, b"hello".to_vec())]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            NestedFlow::Greeting { session } => {
                let session = *session;
                *self = NestedFlow::AwaitingConfirmation { session };
                Ok(FlowYield::io(FlowIoRequest::WaitForSessionConfirmations))
            }
            NestedFlow::AwaitingConfirmation { session } => {
                let session = *session;
                *self = NestedFlow::EnteringChild { session };
                Ok(FlowYield::EnterSubFlow {
                    flow_class: "nested-child".into(),
                    version: 1,
                    is_idempotent: true,
                    is_timed: false,
                })
            }
            NestedFlow::EnteringChild { session } => {
                let session = *session;
                *self = NestedFlow::ChildSending { session };
                Ok(FlowYield::io(FlowIoRequest::Send {
                    sessions: BTreeMap::from([(session, b"from-child".to_vec())]),
                }))
            }
            NestedFlow::ChildSending { session } => {
                let session = *session;
                *self = NestedFlow::LeavingChild { session };
                Ok(FlowYield::LeaveSubFlow)
            }
            NestedFlow::LeavingChild { .. } => Ok(FlowYield::Finish(b"done".to_vec())),
        }
    }
}

// =============================================================================
// Receives from two sessions in one suspension.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum MultiReceiveFlow {
    Starting { first: PeerId, second: PeerId },
    AwaitingFirstSession { second: PeerId },
    AwaitingSecondSession { first_session: SessionId },
    AwaitingBoth { first_session: SessionId, second_session: SessionId },
}

impl FlowLogic for MultiReceiveFlow {
    const NAME: &'static str = "multi-receive";

    fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
        let peers: Vec<String> = serde_json::from_slice(args)
            .map_err(|e| FlowError::internal(format!("bad peer list: {e}")))?;
        match peers.as_slice() {
            [first, second] => Ok(MultiReceiveFlow::Starting {
                first: PeerId::new(first),
                second: PeerId::new(second),
            }),
            _ => Err(FlowError::internal("expected exactly two peers")),
        }
    }

    fn advance(
        &mut self,
        _ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            MultiReceiveFlow::Starting { first, second } => {
                let (first, second) = (first.clone(), second.clone());
                *self = MultiReceiveFlow::AwaitingFirstSession { second };
                Ok(FlowYield::InitiateSession { peer: first })
            }
            MultiReceiveFlow::AwaitingFirstSession { second } => match resume {
                ResumeValue::Session(first_session) => {
                    let second = second.clone();
                    *self = MultiReceiveFlow::AwaitingSecondSession { first_session };
                    Ok(FlowYield::InitiateSession { peer: second })
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            MultiReceiveFlow::AwaitingSecondSession { first_session } => match resume {
                ResumeValue::Session(second_session) => {
                    let first_session = *first_session;
                    *self = MultiReceiveFlow::AwaitingBoth {
                        first_session,
                        second_session,
                    };
                    Ok(FlowYield::io(FlowIoRequest::Receive {
                        sessions: BTreeSet::from([first_session, second_session]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            MultiReceiveFlow::AwaitingBoth {
                first_session,
                second_session,
            } => match resume {
                ResumeValue::Payloads(mut payloads) => {
                    let mut combined = payloads.remove(first_session).unwrap_or_default();
                    combined.extend(payloads.remove(second_session).unwrap_or_default());
                    Ok(FlowYield::Finish(combined))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Collects a fixed number of messages from one session, in order.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum CollectFlow {
    Starting { peer: PeerId },
    AwaitingSession,
    Collecting {
        session: SessionId,
        collected: Vec<u8>,
        remaining: u32,
    },
}

impl FlowLogic for CollectFlow {
    const NAME: &'static str = "collector";

    fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
        Ok(CollectFlow::Starting {
            peer: peer_from_args(args)?,
        })
    }

    fn advance(
        &mut self,
        _ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            CollectFlow::Starting { peer } => {
                let peer = peer.clone();
                *self = CollectFlow::AwaitingSession;
                Ok(FlowYield::InitiateSession { peer })
            }
            CollectFlow::AwaitingSession => match resume {
                ResumeValue::Session(session) => {
                    *self = CollectFlow::Collecting {
                        session,
                        collected: Vec::new(),
                        remaining: 3,
                    };
                    Ok(FlowYield::io(FlowIoRequest::Receive {
                        sessions: BTreeSet::from([session]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            CollectFlow::Collecting {
                session,
                collected,
                remaining,
            } => match resume {
                ResumeValue::Payloads(mut payloads) => {
                    collected.extend(payloads.remove(session).unwrap_or_default());
                    *remaining -= 1;
                    if *remaining > 0 {
                        Ok(FlowYield::io(FlowIoRequest::Receive {
                            sessions: BTreeSet::from([*session]),
                        }))
                    } else {
                        Ok(FlowYield::Finish(collected.clone()))
                    }
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Replay-safe flow: no intermediate checkpoints expected.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum IdempotentReportFlow {
    Starting { peer: PeerId },
    AwaitingSession,
    Reporting,
}

impl FlowLogic for IdempotentReportFlow {
    const NAME: &'static str = "idempotent-reporter";
    const IDEMPOTENT: bool = true;

    fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
        Ok(IdempotentReportFlow::Starting {
            peer: peer_from_args(args)?,
        })
    }

    fn advance(
        &mut self,
        _ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            IdempotentReportFlow::Starting { peer } => {
                let peer = peer.clone();
                *self = IdempotentReportFlow::AwaitingSession;
                Ok(FlowYield::InitiateSession { peer })
            }
            IdempotentReportFlow::AwaitingSession => match resume {
                ResumeValue::Session(session) => {
                    *self = IdempotentReportFlow::Reporting;
                    Ok(FlowYield::io(FlowIoRequest::Send {
                        sessions: BTreeMap::from([(session, b"report".to_vec())]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            IdempotentReportFlow::Reporting => match resume {
                ResumeValue::Acknowledged => Ok(FlowYield::Finish(Vec::new())),
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Timed flow waiting on a counterparty that never answers.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum TimedNotaryFlow {
    Starting { peer: PeerId },
    AwaitingSession,
    AwaitingSignature { session: SessionId },
}

impl FlowLogic for TimedNotaryFlow {
    const NAME: &'static str = "timed-notary";
    const TIMED: bool = true;

    fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
        Ok(TimedNotaryFlow::Starting {
            peer: peer_from_args(args)?,
        })
    }

    fn advance(
        &mut self,
        ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            TimedNotaryFlow::Starting { peer } => {
                ctx.update_timed_flow_timeout(Duration::from_secs(30));
                let peer = peer.clone();
                *self = TimedNotaryFlow::AwaitingSession;
                Ok(FlowYield::InitiateSession { peer })
            }
            TimedNotaryFlow::AwaitingSession => match resume {
                ResumeValue::Session(session) => {
                    *self = TimedNotaryFlow::AwaitingSignature { session };
                    Ok(FlowYield::io(FlowIoRequest::SendAndReceive {
                        sessions: BTreeMap::from([(session, b"notarise".to_vec())]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            TimedNotaryFlow::AwaitingSignature { session } => match resume {
                ResumeValue::Payloads(mut payloads) => {
                    let signature = payloads.remove(session).unwrap_or_default();
                    Ok(FlowYield::Finish(signature))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Sleeps once, then finishes.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum SleepyFlow {
    Starting,
    Sleeping,
}

impl FlowLogic for SleepyFlow {
    const NAME: &'static str = "sleeper";

    fn start(_invocation: &InvocationContext, _args: &[u8]) -> Result<Self, FlowError> {
        Ok(SleepyFlow::Starting)
    }

    fn advance(
        &mut self,
        ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            SleepyFlow::Starting => {
                ctx.set_progress("sleeping");
                *self = SleepyFlow::Sleeping;
                Ok(FlowYield::io(FlowIoRequest::Sleep {
                    duration: Duration::from_secs(60),
                }))
            }
            SleepyFlow::Sleeping => match resume {
                ResumeValue::Acknowledged => Ok(FlowYield::Finish(b"rested".to_vec())),
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
        }
    }
}

// =============================================================================
// Like PingFlow, but observes rejections instead of failing.
// =============================================================================

#[derive(Serialize, Deserialize)]
pub enum CatchFlow {
    Starting { peer: PeerId },
    AwaitingSession,
    AwaitingReply { session: SessionId },
}

impl FlowLogic for CatchFlow {
    const NAME: &'static str = "catcher";

    fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
        Ok(CatchFlow::Starting {
            peer: peer_from_args(args)?,
        })
    }

    fn advance(
        &mut self,
        _ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        match self {
            CatchFlow::Starting { peer } => {
                let peer = peer.clone();
                *self = CatchFlow::AwaitingSession;
                Ok(FlowYield::InitiateSession { peer })
            }
            CatchFlow::AwaitingSession => match resume {
                ResumeValue::Session(session) => {
                    *self = CatchFlow::AwaitingReply { session };
                    Ok(FlowYield::io(FlowIoRequest::SendAndReceive {
                        sessions: BTreeMap::from([(session, b"ping".to_vec())]),
                    }))
                }
                ResumeValue::Failed(e) => Err(e),
                other => Err(unexpected(&other)),
            },
            CatchFlow::AwaitingReply { .. } => match resume {
                ResumeValue::Payloads(_) => Ok(FlowYield::Finish(b"replied".to_vec())),
                ResumeValue::Failed(error) => {
                    Ok(FlowYield::Finish(format!("caught: {error}").into_bytes()))
                }
                other => Err(unexpected(&other)),
            },
        }
    }
}

//! # VIGIL Pipeline
//!
//! The per-call audio transform pipeline.
//!
//! Each call gets exactly one worker; within a call, chunks process
//! strictly serialized in sequence-number order. The six stages:
//!
//! ```text
//! chunk --> preprocess --> speech gate --> recognize --> classify
//!              (DSP)        (VAD)          (external)    intent
//!                             | no speech                  |
//!                             v                            v
//!                       latency-only result   generate --> synthesize
//!                                             response     (external)
//! ```
//!
//! External dependencies (recognizer, intent service, response
//! generator, synthesizer) sit behind [`clients`] traits, each wrapped by
//! a [`breaker::CircuitBreaker`]. Stage failures are fatal to the chunk
//! only: recognizer and synthesizer failures degrade softly (partial
//! result), intent and response failures fall back to the keyword
//! classifier and canned replies.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod breaker;
pub mod chunk;
pub mod clients;
pub mod context;
pub mod dsp;
pub mod error;
pub mod executor;
pub mod intent;
pub mod respond;
pub mod vad;

pub use breaker::{BreakerError, BreakerState, CircuitBreaker};
pub use clients::{
    IntentClassifier, IntentContext, Recognition, ResponseContext, ResponseGenerator,
    SpeechRecognizer, SpeechSynthesizer, VoiceProfile,
};
pub use error::{PipelineError, Result};
pub use executor::{AudioPipeline, PipelineEvent, StageClients};

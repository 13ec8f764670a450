//! Feynman Tutor: turns posted transcripts into a quiz, grades the answers,
//! then asks the learner to explain the material back.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod tutor;

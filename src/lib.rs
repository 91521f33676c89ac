//! agentserver: multi-tenant WhatsApp AI bot orchestrator.
//!
//! Per tenant it keeps a long-lived messaging session, drives inbound
//! messages through an AI tool loop, runs scripted flows, and sweeps
//! inactive chats with label-driven automations. The WhatsApp socket, the
//! database and the key-value store are consumed through seams
//! ([`transport::Transport`], [`repo::Repository`], [`kv::KvStore`]).

pub mod accumulator;
pub mod automation;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod events;
pub mod flow;
pub mod gateway;
pub mod kv;
pub mod llm;
pub mod media;
pub mod repo;
pub mod shared;
pub mod tools;
pub mod transport;
pub mod web;

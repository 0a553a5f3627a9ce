// LLM Throughput Benchmark - Library root for testing

pub mod backend;
pub mod bench;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod tokenizer;

pub mod cpu_pool;
pub mod llm_instructions;
pub mod text;

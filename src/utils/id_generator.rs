//! Opaque id generation for sessions, runs, and checkpoints.

use uuid::Uuid;

/// Generates `uuid::Uuid::new_v4`-backed ids with short, purpose-specific prefixes.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_run_id(&self) -> String {
        format!("run-{}", Uuid::new_v4())
    }

    pub fn generate_checkpoint_id(&self) -> String {
        format!("ckpt-{}", Uuid::new_v4())
    }

    pub fn generate_session_id(&self) -> String {
        format!("session-{}", Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let gen = IdGenerator::new();
        let a = gen.generate_run_id();
        let b = gen.generate_run_id();
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
    }
}

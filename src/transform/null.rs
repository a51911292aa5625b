//! Copies upstream bytes to downstream verbatim. Exists mostly as a
//! template and test harness for the rest of the chain.

use super::TransformStageImpl;

pub struct NullTransform;

impl TransformStageImpl for NullTransform {
    fn process(&mut self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }

    fn finish(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_bytes_through_unchanged() {
        let mut t = NullTransform;
        assert_eq!(t.process(b"abc"), b"abc");
        assert!(t.finish().is_empty());
    }
}

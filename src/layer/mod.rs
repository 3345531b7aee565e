//! Layer stack: resolution, directory union and copy-on-write
//!
//! A mount sees an ordered stack of layers. The topmost layer is the
//! mount's own writable layer; everything below it is read-only for this
//! mount and may be shared with other mounts.

mod cow;
mod resolve;
mod union;

pub use cow::Promoter;
pub use resolve::Resolved;
pub use union::UnionMerge;

/// Ordered layers of one mount, bottom first, writable layer last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStack {
    layers: Vec<String>,
}

impl LayerStack {
    /// Stack `base` layers (bottom to top) under the `writable` layer
    pub fn new(base: &[String], writable: &str) -> Self {
        let mut layers: Vec<String> = base.iter().filter(|l| *l != writable).cloned().collect();
        layers.push(writable.to_string());
        LayerStack { layers }
    }

    /// This mount's writable layer
    pub fn writable(&self) -> &str {
        // new() always pushes the writable layer
        &self.layers[self.layers.len() - 1]
    }

    /// All layers, bottom first
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    /// Layers below the writable one, bottom first
    pub fn lower(&self) -> &[String] {
        &self.layers[..self.layers.len() - 1]
    }

    /// Layers in resolution order, topmost first
    pub fn top_down(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().rev().map(String::as_str)
    }

    pub fn is_writable(&self, layer: &str) -> bool {
        layer == self.writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_order() {
        let stack = LayerStack::new(&["1".to_string(), "2".to_string()], "3");
        assert_eq!(stack.writable(), "3");
        assert_eq!(stack.lower(), &["1".to_string(), "2".to_string()]);
        assert_eq!(stack.top_down().collect::<Vec<_>>(), vec!["3", "2", "1"]);
        assert!(stack.is_writable("3"));
        assert!(!stack.is_writable("1"));
    }

    #[test]
    fn test_writable_not_duplicated_in_base() {
        let stack = LayerStack::new(&["1".to_string(), "3".to_string()], "3");
        assert_eq!(stack.layers(), &["1".to_string(), "3".to_string()]);
    }

    #[test]
    fn test_empty_base() {
        let stack = LayerStack::new(&[], "7");
        assert!(stack.lower().is_empty());
        assert_eq!(stack.writable(), "7");
    }
}

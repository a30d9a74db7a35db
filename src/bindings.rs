//! Key-to-action binding table.

use evdev::Key;

/// A trigger key paired with the action to run on each press.
pub struct Binding<'a> {
    key: Key,
    action: Box<dyn Fn() + 'a>,
}

impl<'a> Binding<'a> {
    pub fn new(key: Key, action: impl Fn() + 'a) -> Self {
        Self {
            key,
            action: Box::new(action),
        }
    }
}

/// Ordered binding table, scanned top to bottom; the first match fires.
pub struct Bindings<'a> {
    bindings: Vec<Binding<'a>>,
}

impl<'a> Bindings<'a> {
    pub fn new(bindings: Vec<Binding<'a>>) -> Self {
        Self { bindings }
    }

    /// Runs the first binding matching `key`. Returns whether one fired.
    pub fn dispatch(&self, key: Key) -> bool {
        match self.bindings.iter().find(|b| b.key == key) {
            Some(binding) => {
                (binding.action)();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn dispatch_runs_only_the_first_match() {
        let first = Cell::new(0);
        let second = Cell::new(0);
        let bindings = Bindings::new(vec![
            Binding::new(Key::KEY_BRIGHTNESSUP, || first.set(first.get() + 1)),
            Binding::new(Key::KEY_BRIGHTNESSUP, || second.set(second.get() + 1)),
        ]);
        assert!(bindings.dispatch(Key::KEY_BRIGHTNESSUP));
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 0);
    }

    #[test]
    fn dispatch_ignores_unbound_keys() {
        let fired = Cell::new(false);
        let bindings = Bindings::new(vec![Binding::new(Key::KEY_BRIGHTNESSDOWN, || {
            fired.set(true)
        })]);
        assert!(!bindings.dispatch(Key::KEY_MUTE));
        assert!(!fired.get());
    }
}

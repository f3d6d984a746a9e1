use crate::reactor::ConnId;

/// The set of connections one reactor cycle drives. Purely bookkeeping: the
/// owner links connections in once instead of rebuilding a list every cycle.
/// Membership is independent of connection lifetime; a stale id is skipped
/// by the reactor.
#[derive(Debug, Default, Clone)]
pub struct ProcessSet {
    ids: Vec<ConnId>,
}

impl ProcessSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn link(&mut self, id: ConnId) {
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
    }

    pub fn unlink(&mut self, id: ConnId) {
        self.ids.retain(|&other| other != id);
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.ids.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_unlink() {
        let a = ConnId::new_test(1);
        let b = ConnId::new_test(2);

        let mut set = ProcessSet::new();
        assert!(set.is_empty());

        set.link(a);
        set.link(b);
        set.link(a);
        assert_eq!(set.len(), 2);
        assert!(set.contains(a));

        set.unlink(a);
        assert!(!set.contains(a));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![b]);

        // Unlinking an id that was never linked is fine.
        set.unlink(a);
        assert_eq!(set.len(), 1);
    }
}

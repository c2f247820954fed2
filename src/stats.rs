use serde::Serialize;

/// Named tree of counters that components append themselves into. The
/// aggregation and pretty-printing of this tree belongs to the embedding
/// driver; the simulator only fills it in.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StatGroup {
    name: String,
    counters: Vec<StatCounter>,
    groups: Vec<StatGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatCounter {
    name: String,
    value: u64,
}

impl StatGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            counters: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, name: &str, value: u64) {
        self.counters.push(StatCounter {
            name: name.to_string(),
            value,
        });
    }

    pub fn push_group(&mut self, group: StatGroup) {
        self.groups.push(group);
    }

    /// Counter value by name within this group.
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value)
    }

    /// Direct child group by name.
    pub fn group(&self, name: &str) -> Option<&StatGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Depth-first lookup of a counter anywhere in the tree.
    pub fn find_counter(&self, name: &str) -> Option<u64> {
        self.counter(name)
            .or_else(|| self.groups.iter().find_map(|g| g.find_counter(name)))
    }
}

use super::{RunType, StatusDocument};
use crate::config::RetentionPolicy;
use std::collections::{HashMap, HashSet};

/// Lineage view of a status document used to decide what retention may drop.
///
/// A record is live when it is among the newest `copies` of its own bucket.
/// A record is needed when it is live or when any of its descendants is.
struct Lineage<'a> {
    live: HashSet<&'a str>,
    children: HashMap<&'a str, Vec<&'a str>>,
    needed: HashMap<&'a str, bool>,
}

impl<'a> Lineage<'a> {
    fn new(doc: &'a StatusDocument, policy: &RetentionPolicy) -> Self {
        let mut live = HashSet::new();
        for run_type in RunType::ALL {
            let records = doc.chronological(run_type);
            let skip = records.len().saturating_sub(policy.copies(run_type));
            live.extend(records[skip..].iter().map(|(name, _)| *name));
        }

        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for (_, name, record) in doc.iter() {
            if let Some(parent) = record.parent.as_deref() {
                children.entry(parent).or_default().push(name);
            }
        }

        Self {
            live,
            children,
            needed: HashMap::new(),
        }
    }

    fn is_needed(&mut self, name: &'a str) -> bool {
        if let Some(needed) = self.needed.get(name) {
            return *needed;
        }
        // provisional answer so a malformed cycle terminates
        self.needed.insert(name, true);
        let kids = self.children.get(name).cloned().unwrap_or_default();
        let needed = self.live.contains(name) || kids.into_iter().any(|c| self.is_needed(c));
        self.needed.insert(name, needed);
        needed
    }

    fn collect_post_order(&self, name: &'a str, out: &mut Vec<&'a str>, planned: &mut HashSet<&'a str>) {
        if !planned.insert(name) {
            return;
        }
        if let Some(kids) = self.children.get(name) {
            for child in kids {
                self.collect_post_order(child, out, planned);
            }
        }
        out.push(name);
    }
}

/// Groups of artifacts that may be deleted from the `run_type` bucket.
///
/// Each group is an expired record plus every record that depends on it,
/// ordered so that descendants always come before their parent. A full
/// backup that still anchors a live incremental is never part of a group.
pub fn plan_expiry(
    doc: &StatusDocument,
    run_type: RunType,
    policy: &RetentionPolicy,
) -> Vec<Vec<String>> {
    let mut lineage = Lineage::new(doc, policy);
    let mut planned = HashSet::new();
    let mut groups = Vec::new();

    for (name, _) in doc.chronological(run_type) {
        if planned.contains(name) || lineage.is_needed(name) {
            continue;
        }
        let mut group = Vec::new();
        lineage.collect_post_order(name, &mut group, &mut planned);
        groups.push(group.into_iter().map(str::to_string).collect());
    }

    groups
}

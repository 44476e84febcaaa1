//! Executed-transaction sets
//!
//! A [`GtidSet`] is the textual `uuid:1-5:7,uuid2:1-3` form the replication
//! engine reports, parsed into sorted, disjoint, inclusive intervals per
//! source. Containment answers "has this instance applied everything that
//! one has" and the difference exposes errant transactions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GtidSet {
    sources: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Total number of transactions in the set
    pub fn count(&self) -> u64 {
        self.sources
            .values()
            .flat_map(|ivs| ivs.iter())
            .map(|(start, end)| end - start + 1)
            .sum()
    }

    /// Add `start..=end` for `source`, merging with adjacent intervals
    pub fn add_interval(&mut self, source: &str, start: u64, end: u64) {
        if start == 0 || end < start {
            return;
        }
        let intervals = self.sources.entry(source.to_string()).or_default();
        intervals.push((start, end));
        intervals.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for &(s, e) in intervals.iter() {
            match merged.last_mut() {
                Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        *intervals = merged;
    }

    /// Append the next transaction number for `source` and return it
    pub fn add_next(&mut self, source: &str) -> u64 {
        let next = self
            .sources
            .get(source)
            .and_then(|ivs| ivs.last())
            .map(|(_, end)| end + 1)
            .unwrap_or(1);
        self.add_interval(source, next, next);
        next
    }

    pub fn union_with(&mut self, other: &GtidSet) {
        for (source, intervals) in &other.sources {
            for &(s, e) in intervals {
                self.add_interval(source, s, e);
            }
        }
    }

    /// `true` when every transaction of `other` is also in `self`
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.subtract(self).is_empty()
    }

    /// Transactions in `self` that are not in `other`
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (source, intervals) in &self.sources {
            let holes = other.sources.get(source).map(Vec::as_slice).unwrap_or(&[]);
            for &(start, end) in intervals {
                let mut cursor = start;
                for &(hs, he) in holes {
                    if he < cursor || hs > end {
                        continue;
                    }
                    if hs > cursor {
                        result.add_interval(source, cursor, hs - 1);
                    }
                    cursor = cursor.max(he.saturating_add(1));
                    if cursor > end {
                        break;
                    }
                }
                if cursor <= end {
                    result.add_interval(source, cursor, end);
                }
            }
        }
        result
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (source, intervals) in &self.sources {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", source)?;
            for &(s, e) in intervals {
                if s == e {
                    write!(f, ":{}", s)?;
                } else {
                    write!(f, ":{}-{}", s, e)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::MetadataCorrupted(format!("invalid GTID set '{}'", s));
        let mut set = GtidSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut fields = part.split(':');
            let source = fields.next().filter(|u| !u.is_empty()).ok_or_else(invalid)?;
            let mut any = false;
            for range in fields {
                any = true;
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (a.parse::<u64>(), b.parse::<u64>()),
                    None => (range.parse::<u64>(), range.parse::<u64>()),
                };
                let (start, end) = (start.map_err(|_| invalid())?, end.map_err(|_| invalid())?);
                if start == 0 || end < start {
                    return Err(invalid());
                }
                set.add_interval(source, start, end);
            }
            if !any {
                return Err(invalid());
            }
        }
        Ok(set)
    }
}

impl TryFrom<String> for GtidSet {
    type Error = crate::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GtidSet> for String {
    fn from(set: GtidSet) -> Self {
        set.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(s: &str) -> GtidSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let g = set("aaa:1-5:7,bbb:3");
        assert_eq!(g.to_string(), "aaa:1-5:7,bbb:3");
        assert_eq!(g.count(), 7);
        assert!(set("").is_empty());
    }

    #[test]
    fn test_merge_adjacent() {
        let g = set("aaa:1-3:4-6:8");
        assert_eq!(g.to_string(), "aaa:1-6:8");
    }

    #[test]
    fn test_invalid() {
        assert!("aaa".parse::<GtidSet>().is_err());
        assert!("aaa:0-3".parse::<GtidSet>().is_err());
        assert!("aaa:5-3".parse::<GtidSet>().is_err());
        assert!(":1-3".parse::<GtidSet>().is_err());
    }

    #[test]
    fn test_contains_and_subtract() {
        let primary = set("aaa:1-10,bbb:1-2");
        let replica = set("aaa:1-8");
        assert!(primary.contains(&replica));
        assert!(!replica.contains(&primary));
        assert_eq!(primary.subtract(&replica).to_string(), "aaa:9-10,bbb:1-2");

        let errant = set("aaa:1-8,ccc:1");
        assert_eq!(errant.subtract(&primary).to_string(), "ccc:1");
    }

    #[test]
    fn test_subtract_holes() {
        let a = set("aaa:1-10");
        let b = set("aaa:2-3:6");
        assert_eq!(a.subtract(&b).to_string(), "aaa:1:4-5:7-10");
    }

    #[test]
    fn test_add_next() {
        let mut g = GtidSet::new();
        assert_eq!(g.add_next("grp"), 1);
        assert_eq!(g.add_next("grp"), 2);
        g.union_with(&set("other:1-4"));
        assert_eq!(g.to_string(), "grp:1-2,other:1-4");
    }

    #[test]
    fn test_serde_as_string() {
        let g = set("aaa:1-3");
        let json = serde_json::to_string(&g).unwrap();
        assert_eq!(json, "\"aaa:1-3\"");
        let back: GtidSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
    }
}

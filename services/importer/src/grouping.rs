use crate::media_source::{Asset, MediaType};
use chrono::{Local, NaiveDate, TimeZone};
use std::collections::HashMap;

/// All assets captured on one calendar day
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Day in `YYYY-MM-DD` form
    pub date_key: String,
    pub date: NaiveDate,
    /// Assets in listing order
    pub assets: Vec<Asset>,
}

impl Group {
    fn new(date: NaiveDate) -> Self {
        Self {
            date_key: date.format("%Y-%m-%d").to_string(),
            date,
            assets: Vec::new(),
        }
    }

    pub fn photo_count(&self) -> usize {
        self.count(MediaType::Photo)
    }

    pub fn video_count(&self) -> usize {
        self.count(MediaType::Video)
    }

    fn count(&self, media_type: MediaType) -> usize {
        self.assets
            .iter()
            .filter(|a| a.media_type == media_type)
            .count()
    }
}

/// Calendar day of an asset in the given time zone
pub fn local_date<Tz: TimeZone>(asset: &Asset, tz: &Tz) -> NaiveDate {
    asset.created_at.with_timezone(tz).date_naive()
}

/// Partition assets into day groups using the local time zone
pub fn partition(assets: impl IntoIterator<Item = Asset>) -> Vec<Group> {
    partition_in(assets, &Local)
}

/// Partition assets into day groups using `tz` to decide calendar days.
///
/// Groups come out in order of first appearance and keep input order inside.
pub fn partition_in<Tz: TimeZone>(assets: impl IntoIterator<Item = Asset>, tz: &Tz) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<NaiveDate, usize> = HashMap::new();

    for asset in assets {
        let date = local_date(&asset, tz);
        let slot = *index.entry(date).or_insert_with(|| {
            groups.push(Group::new(date));
            groups.len() - 1
        });
        groups[slot].assets.push(asset);
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn asset(id: &str, rfc3339: &str, media_type: MediaType) -> Asset {
        Asset {
            id: id.to_string(),
            uri: format!("file:///media/{id}"),
            media_type,
            created_at: chrono::DateTime::parse_from_rfc3339(rfc3339)
                .unwrap()
                .with_timezone(&Utc),
            width: 0,
            height: 0,
        }
    }

    fn sample() -> Vec<Asset> {
        vec![
            asset("a", "2024-03-01T08:00:00Z", MediaType::Photo),
            asset("b", "2024-03-01T09:30:00Z", MediaType::Video),
            asset("c", "2024-03-02T10:00:00Z", MediaType::Photo),
            asset("d", "2024-03-01T23:59:59Z", MediaType::Photo),
            asset("e", "2024-03-05T00:00:00Z", MediaType::Photo),
        ]
    }

    fn ids(group: &Group) -> Vec<&str> {
        group.assets.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn test_partition_by_day() {
        let groups = partition_in(sample(), &Utc);

        let keys: Vec<&str> = groups.iter().map(|g| g.date_key.as_str()).collect();
        assert_eq!(keys, vec!["2024-03-01", "2024-03-02", "2024-03-05"]);
        assert_eq!(ids(&groups[0]), vec!["a", "b", "d"]);
        assert_eq!(groups[0].photo_count(), 2);
        assert_eq!(groups[0].video_count(), 1);
    }

    #[test]
    fn test_partition_preserves_asset_count() {
        let assets = sample();
        let total = assets.len();
        let groups = partition_in(assets, &Utc);

        assert_eq!(groups.iter().map(|g| g.assets.len()).sum::<usize>(), total);
    }

    #[test]
    fn test_membership_independent_of_permutation() {
        let mut reversed = sample();
        reversed.reverse();

        let forward = partition_in(sample(), &Utc);
        let backward = partition_in(reversed, &Utc);

        for group in &forward {
            let other = backward
                .iter()
                .find(|g| g.date_key == group.date_key)
                .expect("same days in both partitions");
            let mut expected = ids(group);
            expected.reverse();
            // Same members, in the (reversed) input order
            assert_eq!(ids(other), expected);
        }
        assert_eq!(forward.len(), backward.len());
    }

    #[test]
    fn test_day_boundary_follows_time_zone() {
        // 23:59:59 UTC on March 1st is already March 2nd at UTC+2
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let groups = partition_in(sample(), &plus_two);

        let march_2 = groups.iter().find(|g| g.date_key == "2024-03-02").unwrap();
        assert_eq!(ids(march_2), vec!["c", "d"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(partition_in(Vec::new(), &Utc).is_empty());
    }
}

//! The normalized observation record that every reader produces.
//!
//! Regardless of the agency format it came from, each record carries a
//! location in degrees, a GMT timestamp, and a `site_id_poc` key that
//! identifies one instrument stream at one site. Everything downstream of
//! the readers works only with these fields plus the named measurement
//! values.
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::{IndexMap, IndexSet};

use crate::dates::local_to_gmt;
use crate::error::DateTimeError;

/// One measurement event at one site.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRecord {
    pub site_id: String,
    /// Parameter occurrence code, distinguishing co-located instruments
    pub poc: String,
    /// `site_id` and `poc` joined with a hyphen
    pub site_id_poc: String,
    pub lon: f64,
    pub lat: f64,
    pub local_time: NaiveDateTime,
    /// Hours to add to `local_time` to get GMT
    pub gmt_offset: f64,
    pub gmt_time: DateTime<Utc>,
    pub values: IndexMap<String, f64>,
}

impl ObservationRecord {
    /// Create a record, deriving `site_id_poc` and the GMT timestamp.
    pub fn new<S: Into<String>, P: Into<String>>(
        site_id: S,
        poc: P,
        lon: f64,
        lat: f64,
        local_time: NaiveDateTime,
        gmt_offset: f64,
        values: IndexMap<String, f64>,
    ) -> Result<Self, DateTimeError> {
        let site_id = site_id.into();
        let poc = poc.into();
        let site_id_poc = make_site_id_poc(&site_id, &poc);
        let gmt_time = local_to_gmt(local_time, gmt_offset)?;
        Ok(Self {
            site_id,
            poc,
            site_id_poc,
            lon,
            lat,
            local_time,
            gmt_offset,
            gmt_time,
            values,
        })
    }

    /// Get a measurement by name, `None` if this record does not have it.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

pub fn make_site_id_poc(site_id: &str, poc: &str) -> String {
    format!("{site_id}-{poc}")
}

/// An ordered collection of observation records read from one input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationSet {
    records: Vec<ObservationRecord>,
}

impl ObservationSet {
    pub fn new(records: Vec<ObservationRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[ObservationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ObservationRecord> {
        self.records.iter()
    }

    /// `(lon, lat)` of every record, in record order.
    pub fn coordinates(&self) -> Vec<(f64, f64)> {
        self.records.iter().map(|r| (r.lon, r.lat)).collect()
    }

    /// Distinct `site_id_poc` values in order of first appearance.
    pub fn unique_site_keys(&self) -> IndexSet<String> {
        self.records.iter().map(|r| r.site_id_poc.clone()).collect()
    }

    /// Names of all measurement values present on any record, in order of first appearance.
    pub fn value_names(&self) -> IndexSet<String> {
        let mut names = IndexSet::new();
        for rec in self.records.iter() {
            for key in rec.values.keys() {
                if !names.contains(key) {
                    names.insert(key.clone());
                }
            }
        }
        names
    }
}

impl FromIterator<ObservationRecord> for ObservationSet {
    fn from_iter<T: IntoIterator<Item = ObservationRecord>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ObservationSet {
    type Item = &'a ObservationRecord;
    type IntoIter = std::slice::Iter<'a, ObservationRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

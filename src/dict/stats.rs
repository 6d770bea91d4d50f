//! Debugging statistics: per-table size, occupancy, and chain-length
//! distribution.

use std::fmt;

use super::Dict;
use crate::dict_type::DictType;

/// Number of buckets in the chain-length histogram; the last bucket counts
/// every chain of that length or longer.
pub const STATS_HISTOGRAM_LEN: usize = 50;

/// Statistics for one bucket array.
#[derive(Clone, Debug)]
pub struct TableStats {
    /// Which half of the table pair: 0 is the main table, 1 the rehash
    /// target.
    pub table: usize,
    /// Bucket count.
    pub size: usize,
    /// Live entry count.
    pub used: usize,
    /// Buckets with at least one entry.
    pub nonempty_slots: usize,
    /// Longest chain.
    pub max_chain_len: usize,
    /// Mean length of the chains actually walked.
    pub avg_chain_len_counted: f64,
    /// `used / nonempty_slots`.
    pub avg_chain_len_computed: f64,
    /// `histogram[n]` counts buckets whose chain is `n` long; the last
    /// slot counts chains of `STATS_HISTOGRAM_LEN - 1` or longer.
    pub histogram: [usize; STATS_HISTOGRAM_LEN],
}

/// Snapshot of dict statistics, produced by [`Dict::stats`]. `None` for a
/// table that holds no entries. The [`Display`][fmt::Display]
/// implementation renders the full human-readable report.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// The main table.
    pub main: Option<TableStats>,
    /// The rehash target, while a rehash is in progress.
    pub rehash_target: Option<TableStats>,
}

impl<K, V, T> Dict<K, V, T>
where
    T: DictType<K, V>,
{
    /// Collects per-table statistics. The rehash target is included only
    /// while a rehash is in progress.
    pub fn stats(&self) -> Stats {
        Stats {
            main: self.table_stats(0),
            rehash_target: if self.is_rehashing() {
                self.table_stats(1)
            } else {
                None
            },
        }
    }

    fn table_stats(&self, htidx: usize) -> Option<TableStats> {
        if self.ht[htidx].used == 0 {
            return None;
        }
        let table = self.ht[htidx].table.as_ref()?;

        let mut nonempty_slots = 0usize;
        let mut max_chain_len = 0usize;
        let mut total_chain_len = 0usize;
        let mut histogram = [0usize; STATS_HISTOGRAM_LEN];

        for slot in table.iter() {
            if slot.is_null() {
                histogram[0] += 1;
                continue;
            }
            nonempty_slots += 1;
            let mut chain_len = 0usize;
            let mut he = *slot;
            while !he.is_null() {
                chain_len += 1;
                he = unsafe { self.next_of(he) };
            }
            histogram[chain_len.min(STATS_HISTOGRAM_LEN - 1)] += 1;
            max_chain_len = max_chain_len.max(chain_len);
            total_chain_len += chain_len;
        }

        Some(TableStats {
            table: htidx,
            size: table.len(),
            used: self.ht[htidx].used,
            nonempty_slots,
            max_chain_len,
            avg_chain_len_counted: total_chain_len as f64 / nonempty_slots as f64,
            avg_chain_len_computed: self.ht[htidx].used as f64 / nonempty_slots as f64,
            histogram,
        })
    }
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.table == 0 {
            "main hash table"
        } else {
            "rehashing target"
        };
        writeln!(f, "Hash table {} stats ({role}):", self.table)?;
        writeln!(f, " table size: {}", self.size)?;
        writeln!(f, " number of elements: {}", self.used)?;
        writeln!(f, " different slots: {}", self.nonempty_slots)?;
        writeln!(f, " max chain length: {}", self.max_chain_len)?;
        writeln!(
            f,
            " avg chain length (counted): {:.2}",
            self.avg_chain_len_counted
        )?;
        writeln!(
            f,
            " avg chain length (computed): {:.2}",
            self.avg_chain_len_computed
        )?;
        writeln!(f, " Chain length distribution:")?;
        for (len, &count) in self.histogram.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let marker = if len == STATS_HISTOGRAM_LEN - 1 { ">=" } else { "" };
            writeln!(
                f,
                "   {marker}{len}: {count} ({:.2}%)",
                count as f64 / self.size as f64 * 100.0
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.main {
            Some(main) => main.fmt(f)?,
            None => writeln!(
                f,
                "Hash table 0 stats (main hash table):\n\
                 No stats available for empty dictionaries"
            )?,
        }
        if let Some(target) = &self.rehash_target {
            target.fmt(f)?;
        }
        Ok(())
    }
}

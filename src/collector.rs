//! Random sampling of sentence pairs containing a source phrase
//!
//! Domains of the translation context are searched first, in order of
//! decreasing score. When background search is enabled, or there is no
//! context, the remaining domains are searched afterwards through a global
//! scan. Phrases longer than the prefix length are looked up by their first
//! `L` words. Every sample is verified against the stored source sentence.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::trace;

use crate::cursor::PrefixCursor;
use crate::error::Result;
use crate::key::{self, KeyType};
use crate::posting::Posting;
use crate::storage::CorporaStorage;
use crate::store::IndexStore;
use crate::types::{Context, ContextScore, Domain, Length, Sample, WordId};

pub struct Collector {
    storage: Arc<CorporaStorage>,
    store: Arc<IndexStore>,
    prefix_length: u8,
    /// Context domains by decreasing score, deduplicated, without deleted ones
    context: Vec<ContextScore>,
    /// Whether the caller gave a non-empty context, deleted domains included
    has_context: bool,
    search_in_background: bool,
    /// Domains with a deletion marker at creation time
    deleted: HashSet<Domain>,
    phrase: Vec<WordId>,
}

impl Collector {
    pub fn new(
        storage: Arc<CorporaStorage>,
        store: Arc<IndexStore>,
        prefix_length: u8,
        context: Option<&Context>,
        search_in_background: bool,
    ) -> Result<Self> {
        let mut deleted = HashSet::new();
        for guard in store.prefix(&KeyType::DomainDeletion.prefix()) {
            let key = guard.key()?;
            deleted.insert(key::domain_from_key(&key, prefix_length)?);
        }

        let mut sorted: Vec<ContextScore> = context.cloned().unwrap_or_default();
        sorted.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.domain.cmp(&b.domain)));
        let mut seen = HashSet::new();
        sorted.retain(|c| seen.insert(c.domain));
        let has_context = !sorted.is_empty();
        sorted.retain(|c| !deleted.contains(&c.domain));

        Ok(Self {
            storage,
            store,
            prefix_length,
            context: sorted,
            has_context,
            search_in_background,
            deleted,
            phrase: Vec::new(),
        })
    }

    /// Phrase accumulated by the calls to [`Collector::extend`] so far
    pub fn phrase(&self) -> &[WordId] {
        &self.phrase
    }

    pub fn reset(&mut self) {
        self.phrase.clear();
    }

    /// Appends `phrase` to the accumulated phrase and replaces `out` with up
    /// to `limit` samples containing it. A `limit` of 0 means no limit.
    pub fn extend(&mut self, phrase: &[WordId], limit: usize, out: &mut Vec<Sample>) -> Result<()> {
        self.phrase.extend_from_slice(phrase);
        out.clear();
        if self.phrase.is_empty() {
            return Ok(());
        }

        let mut remaining = if limit == 0 { usize::MAX } else { limit };
        let context_domains: HashSet<Domain> = self.context.iter().map(|c| c.domain).collect();

        for score in &self.context {
            if remaining == 0 {
                break;
            }
            let mut cursor =
                PrefixCursor::for_domain(self.store.clone(), self.prefix_length, score.domain);
            let candidates = self.candidates(&mut cursor, |_| true)?;
            remaining -= self.collect(candidates, remaining, out)?;
        }

        if remaining > 0 && (self.search_in_background || !self.has_context) {
            let mut cursor = PrefixCursor::global(self.store.clone(), self.prefix_length);
            let candidates = self.candidates(&mut cursor, |d| !context_domains.contains(&d))?;
            self.collect(candidates, remaining, out)?;
        }

        trace!(
            phrase_len = self.phrase.len(),
            samples = out.len(),
            "collected samples"
        );
        Ok(())
    }

    /// Start positions of the phrase grouped by sentence offset
    fn candidates(
        &self,
        cursor: &mut PrefixCursor,
        accept: impl Fn(Domain) -> bool,
    ) -> Result<BTreeMap<i64, (Domain, Vec<Length>)>> {
        cursor.seek(&self.phrase)?;

        let mut postings: Vec<Posting> = Vec::new();
        while let Some(entry) = cursor.next_entry()? {
            if self.deleted.contains(&entry.domain) || !accept(entry.domain) {
                continue;
            }
            entry.values(&mut postings)?;
        }

        let mut grouped: BTreeMap<i64, (Domain, Vec<Length>)> = BTreeMap::new();
        for posting in postings {
            grouped
                .entry(posting.offset)
                .or_insert_with(|| (posting.domain, Vec::new()))
                .1
                .push(posting.start);
        }
        for (_, starts) in grouped.values_mut() {
            starts.sort_unstable();
            starts.dedup();
        }
        Ok(grouped)
    }

    /// Retrieves up to `limit` of the candidate sentences into `out`, picking
    /// a uniform random subset when there are more. Returns the number added.
    fn collect(
        &self,
        candidates: BTreeMap<i64, (Domain, Vec<Length>)>,
        limit: usize,
        out: &mut Vec<Sample>,
    ) -> Result<usize> {
        let mut candidates: Vec<(i64, Vec<Length>)> = candidates
            .into_iter()
            .map(|(offset, (_, starts))| (offset, starts))
            .collect();
        if candidates.len() > limit {
            candidates.shuffle(&mut rand::thread_rng());
        }

        let mut added = 0;
        for (offset, starts) in candidates {
            if added == limit {
                break;
            }
            // Long phrases only matched their first L words in the index
            let pair = self.storage.retrieve(offset)?;
            let offsets: Vec<Length> = starts
                .into_iter()
                .filter(|&start| self.matches_at(&pair.source, start as usize))
                .collect();
            if offsets.is_empty() {
                continue;
            }

            out.push(Sample {
                domain: pair.domain,
                source: pair.source,
                target: pair.target,
                alignment: pair.alignment,
                offsets,
            });
            added += 1;
        }
        Ok(added)
    }

    fn matches_at(&self, source: &[WordId], start: usize) -> bool {
        source
            .get(start..start + self.phrase.len())
            .is_some_and(|words| words == self.phrase.as_slice())
    }
}

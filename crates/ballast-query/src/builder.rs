//! Fluent, immutable query construction.
//!
//! Every method takes the builder by value and returns a new one; clone a
//! base query to branch it. Nothing touches the network until a terminal
//! call (`all`, `first`, `count`, `iterate`) runs.

use std::collections::VecDeque;

use futures::stream::{self, Stream};

use ballast_types::{Error, Filter, Operation, OrderBy, Record};

use crate::QueryEngine;

/// Accumulates a read operation and executes it lazily.
#[derive(Clone)]
pub struct QueryBuilder {
    engine: QueryEngine,
    entity: String,
    filter: Option<Filter>,
    fields: Vec<String>,
    order: Vec<OrderBy>,
    limit: Option<u32>,
    offset: Option<u32>,
    eager: Vec<String>,
}

impl QueryBuilder {
    pub(crate) fn new(engine: QueryEngine, entity: String) -> Self {
        QueryBuilder {
            engine,
            entity,
            filter: None,
            fields: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            eager: Vec::new(),
        }
    }

    /// AND another filter onto the query. Build OR/NOT shapes with the
    /// [`Filter`] combinators and pass the composed filter here.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and_with(filter),
            None => filter,
        });
        self
    }

    /// Narrow the fetched field set. Without a selection the remote default
    /// field set is returned.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Append an ordering term.
    pub fn order_by(mut self, term: OrderBy) -> Self {
        self.order.push(term);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Eagerly resolve a relationship field at fetch time via the batched
    /// prefetch path, instead of returning a lazy ref.
    pub fn eager(mut self, field: impl Into<String>) -> Self {
        self.eager.push(field.into());
        self
    }

    /// The operation this builder describes. Identical chains produce
    /// identical operations and cache keys.
    pub fn to_operation(&self) -> Operation {
        let mut op = Operation::read(&self.entity);
        op.filter = self.filter.clone();
        op.fields = self.fields.clone();
        op.order = self.order.clone();
        op.limit = self.limit;
        op.offset = self.offset;
        op
    }

    /// The count operation: filter only, so equivalent counts share a cache
    /// key regardless of selection or ordering.
    fn count_operation(&self) -> Operation {
        let mut op = Operation::read(&self.entity);
        op.filter = self.filter.clone();
        op.method = Some("count".to_string());
        op
    }

    /// Fetch all matching records.
    pub async fn all(self) -> Result<Vec<Record>, Error> {
        self.engine.check_eager(&self.entity, &self.eager)?;
        let op = self.to_operation();
        let mut records = self.engine.fetch_records(&op).await?;
        for field in &self.eager {
            let related = self.engine.prefetch(&records, field).await?;
            records = QueryEngine::attach_prefetched(records, field, &related);
        }
        Ok(records)
    }

    /// Fetch the first matching record, if any.
    pub async fn first(self) -> Result<Option<Record>, Error> {
        let limited = self.limit(1);
        Ok(limited.all().await?.into_iter().next())
    }

    /// Count matching records without fetching them.
    pub async fn count(self) -> Result<u64, Error> {
        self.engine.fetch_count(&self.count_operation()).await
    }

    /// Stream matching records, fetching `page_size` at a time.
    ///
    /// A limit set on the builder caps the total streamed; an offset shifts
    /// the starting point. Eager fields are not resolved while iterating.
    pub fn iterate(self, page_size: u32) -> impl Stream<Item = Result<Record, Error>> {
        assert!(page_size > 0, "iterate page_size must be at least 1");

        struct PageState {
            engine: QueryEngine,
            base: Operation,
            next_offset: u32,
            remaining: Option<u32>,
            buffer: VecDeque<Record>,
            done: bool,
        }

        let base = self.to_operation();
        let state = PageState {
            engine: self.engine,
            next_offset: base.offset.unwrap_or(0),
            remaining: base.limit,
            base,
            buffer: VecDeque::new(),
            done: false,
        };

        stream::try_unfold(state, move |mut st| async move {
            loop {
                if let Some(record) = st.buffer.pop_front() {
                    return Ok(Some((record, st)));
                }
                if st.done {
                    return Ok(None);
                }
                let page_limit = match st.remaining {
                    Some(0) => return Ok(None),
                    Some(remaining) => page_size.min(remaining),
                    None => page_size,
                };

                let mut op = st.base.clone();
                op.offset = Some(st.next_offset);
                op.limit = Some(page_limit);

                let records = st.engine.fetch_records(&op).await?;
                let got = records.len() as u32;
                st.next_offset += got;
                if let Some(remaining) = &mut st.remaining {
                    *remaining -= got.min(*remaining);
                }
                if got < page_limit {
                    st.done = true;
                }
                if got == 0 {
                    return Ok(None);
                }
                st.buffer.extend(records);
            }
        })
    }
}

//! Writing and reading a whole board's worth of space events.

use std::collections::HashSet;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::space_events::{
    list_len, parse_space_event_list, parse_space_event_table, table_len,
    write_space_event_list, write_space_event_table, SpaceEventEntry, SpaceTableEntry,
};
use super::{write_event, EventCache, EventInstance, EventRegistry, PlacementContext, WriteScratch};
use crate::codec::align;
use crate::{RomError, Result};

/// The events attached to one board space.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceEvents {
    pub space: u16,
    #[serde(default)]
    pub events: Vec<EventInstance>,
}

/// An instance that could not be written. The rest of the batch still was.
#[derive(Debug)]
pub struct EventFailure {
    pub space: u16,
    pub event: String,
    pub error: RomError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub failures: Vec<EventFailure>,
    pub table_offset: usize,
    pub table_address: u32,
    /// From the context's starting offset to the end of the table.
    pub bytes_used: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedEvent {
    Recognized(EventInstance),
    /// Code no definition claims, kept as a bare address.
    Unrecognized {
        activation: u16,
        mystery: u16,
        address: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSpace {
    pub space: u16,
    pub events: Vec<ParsedEvent>,
}

/// Lays out handler code, then one list per space, then the table, starting
/// at `ctx.offset` of `region`.
///
/// Capacity problems abort the batch. Any other per-instance failure is
/// recorded in the report and the instance is left out.
pub fn write_board_events(
    region: &mut [u8],
    spaces: &mut [SpaceEvents],
    registry: &EventRegistry,
    ctx: &PlacementContext,
    scratch: &mut WriteScratch,
    cache: &EventCache,
) -> Result<BatchReport> {
    let mut seen = HashSet::new();
    for s in spaces.iter() {
        if !seen.insert(s.space) {
            return Err(RomError::Config(format!(
                "space {} appears twice in the event plan",
                s.space
            )));
        }
    }

    let mut report = BatchReport::default();
    let mut cursor = align(ctx.offset, 4);
    let mut lists: Vec<(u16, Vec<SpaceEventEntry>)> = Vec::new();

    for space in spaces.iter_mut() {
        let mut entries = Vec::new();
        for instance in space.events.iter_mut() {
            let Some(def) = registry.get(&instance.id) else {
                warn!("space {}: unknown event {}", space.space, instance.id);
                report.failures.push(EventFailure {
                    space: space.space,
                    event: instance.id.clone(),
                    error: RomError::UnknownEvent(instance.id.clone()),
                });
                continue;
            };

            let here = ctx.at(cursor).on_space(space.space as usize);
            match write_event(region, registry, instance, &here, scratch, cache) {
                Ok(placed) => {
                    cursor = align(cursor + placed.length, 4);
                    entries.push(SpaceEventEntry {
                        activation: def.activation().to_u16(),
                        mystery: def.execution().to_u16(),
                        address: placed.address,
                    });
                }
                Err(err @ RomError::Capacity(_)) => return Err(err),
                Err(err) => {
                    warn!("space {}: {} not written: {err}", space.space, instance.id);
                    report.failures.push(EventFailure {
                        space: space.space,
                        event: instance.id.clone(),
                        error: err,
                    });
                }
            }
        }
        if !entries.is_empty() {
            lists.push((space.space, entries));
        }
    }

    let mut table = Vec::with_capacity(lists.len());
    for (space, entries) in &lists {
        let written = write_space_event_list(region, cursor, entries)?;
        debug_assert_eq!(written, list_len(entries.len()));
        table.push(SpaceTableEntry {
            space: *space,
            address: ctx.at(cursor).address(),
        });
        cursor += written;
    }

    let written = write_space_event_table(region, cursor, &table)?;
    debug_assert_eq!(written, table_len(table.len()));
    report.table_offset = cursor;
    report.table_address = ctx.at(cursor).address();
    report.bytes_used = cursor + written - ctx.offset;

    info!(
        "wrote events for {} spaces, table at {:#X}, {} bytes, {} failures",
        table.len(),
        report.table_address,
        report.bytes_used,
        report.failures.len()
    );
    Ok(report)
}

/// Reads the table at `table_offset` and identifies every handler it points
/// at. Handlers no definition claims come back as [`ParsedEvent::Unrecognized`].
pub fn parse_board_events(
    buf: &[u8],
    table_offset: usize,
    ctx: &PlacementContext,
    registry: &EventRegistry,
    cache: &mut EventCache,
) -> Result<Vec<ParsedSpace>> {
    let table = parse_space_event_table(buf, table_offset)?;
    let mut spaces = Vec::with_capacity(table.len());

    for entry in table {
        let list_offset = ctx
            .offset_of(entry.address)
            .ok_or_else(|| RomError::truncated("space event list", entry.address as usize))?;
        let list = parse_space_event_list(buf, list_offset)?;

        let events = list
            .into_iter()
            .map(|e| {
                let found = ctx.offset_of(e.address).and_then(|offset| {
                    registry.recognize(buf, &ctx.at(offset).on_space(entry.space as usize), cache)
                });
                match found {
                    Some(instance) => ParsedEvent::Recognized(instance),
                    None => ParsedEvent::Unrecognized {
                        activation: e.activation,
                        mystery: e.mystery,
                        address: e.address,
                    },
                }
            })
            .collect::<Vec<_>>();

        debug!("space {}: {} events", entry.space, events.len());
        spaces.push(ParsedSpace {
            space: entry.space,
            events,
        });
    }
    Ok(spaces)
}

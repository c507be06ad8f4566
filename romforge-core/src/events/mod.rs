//! Board space events: definitions, recognition of existing handlers and
//! placement of new ones.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::game::Game;
use crate::symbols::SymbolLookup;
use crate::{RomError, Result};

pub mod board;
pub mod builtin;
pub mod custom;
pub mod recognize;
pub mod space_events;

pub use board::{
    parse_board_events, write_board_events, BatchReport, EventFailure, ParsedEvent, ParsedSpace,
    SpaceEvents,
};
pub use custom::CustomEvent;

/// When a space runs its handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ActivationType {
    WalkOver,
    LandOn,
    PerTurn,
    BeginOrWalkOver,
}

impl ActivationType {
    pub fn to_u16(self) -> u16 {
        match self {
            ActivationType::WalkOver => 1,
            ActivationType::LandOn => 2,
            ActivationType::PerTurn => 3,
            ActivationType::BeginOrWalkOver => 8,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ActivationType::WalkOver),
            2 => Some(ActivationType::LandOn),
            3 => Some(ActivationType::PerTurn),
            8 => Some(ActivationType::BeginOrWalkOver),
            _ => None,
        }
    }
}

/// How the game invokes the handler. Stored in the `mystery` half of a
/// space event list entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ExecutionType {
    Direct,
    Process,
}

impl ExecutionType {
    pub fn to_u16(self) -> u16 {
        match self {
            ExecutionType::Direct => 1,
            ExecutionType::Process => 2,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ExecutionType::Direct),
            2 => Some(ExecutionType::Process),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ParamType {
    Number,
    PositiveNumber,
    Boolean,
    Space,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventParameter {
    pub name: String,
    pub kind: ParamType,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum PlacementState {
    #[default]
    Unplaced,
    /// Identified in existing code.
    Recognized,
    /// Code generated, not yet committed to the buffer.
    Assembled,
    Written,
}

/// One use of a definition on a board space.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventInstance {
    pub id: String,
    /// Inline arguments, stored as halfwords in front of the code.
    #[serde(default)]
    pub args: Vec<i16>,
    /// Values for named parameters of user-authored events.
    #[serde(default)]
    pub params: BTreeMap<String, i64>,
    #[serde(skip)]
    pub state: PlacementState,
}

impl EventInstance {
    pub fn new(id: impl Into<String>, args: Vec<i16>) -> Self {
        Self {
            id: id.into(),
            args,
            ..Default::default()
        }
    }
}

/// Where code is being placed or read.
///
/// `offset` indexes the buffer being worked on and `ram_base` is the RAM
/// address of that buffer's first byte.
#[derive(Clone, Copy)]
pub struct PlacementContext<'a> {
    pub game: Game,
    pub board: usize,
    pub space: usize,
    pub offset: usize,
    pub ram_base: u32,
    pub symbols: &'a dyn SymbolLookup,
}

impl<'a> PlacementContext<'a> {
    pub fn new(game: Game, ram_base: u32, symbols: &'a dyn SymbolLookup) -> Self {
        Self {
            game,
            board: 0,
            space: 0,
            offset: 0,
            ram_base,
            symbols,
        }
    }

    pub fn address(&self) -> u32 {
        self.ram_base.wrapping_add(self.offset as u32)
    }

    pub fn advanced(&self, bytes: usize) -> Self {
        Self {
            offset: self.offset + bytes,
            ..*self
        }
    }

    pub fn at(&self, offset: usize) -> Self {
        Self { offset, ..*self }
    }

    pub fn on_space(&self, space: usize) -> Self {
        Self { space, ..*self }
    }

    /// Buffer offset of a RAM address, if it falls after `ram_base`.
    pub fn offset_of(&self, address: u32) -> Option<usize> {
        address
            .checked_sub(self.ram_base)
            .map(|rel| rel as usize)
    }

    /// Looks up a symbol, failing with an assembly error naming it.
    pub fn symbol(&self, name: &str) -> Result<u32> {
        self.symbols
            .find(self.game, name)
            .ok_or_else(|| RomError::Assembly {
                game: self.game,
                message: format!("symbol {name} is not defined"),
            })
    }
}

/// Per-pass mutable state: shared code addresses and running counters.
#[derive(Clone, Debug, Default)]
pub struct WriteScratch {
    shared: HashMap<(Game, String), u32>,
    counters: HashMap<String, u32>,
}

impl WriteScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared_address(&self, game: Game, id: &str) -> Option<u32> {
        self.shared.get(&(game, id.to_string())).copied()
    }

    pub fn record_shared(&mut self, game: Game, id: &str, address: u32) {
        self.shared.insert((game, id.to_string()), address);
    }

    /// Returns the counter's current value and increments it.
    pub fn next(&mut self, counter: &str) -> u32 {
        let slot = self.counters.entry(counter.to_string()).or_insert(0);
        let value = *slot;
        *slot += 1;
        value
    }
}

/// Bytes before a handler covered by a recognition key (inline arguments).
const RECOGNITION_KEY_BEFORE: usize = 0x20;
/// Bytes from a handler's start covered by a recognition key.
const RECOGNITION_KEY_AFTER: usize = 0x100;

/// Where a recognition result came from: the address and a digest of the
/// bytes around it, so rewritten code is never answered from the cache.
type RecognitionKey = (Game, u32, [u8; 16]);

fn recognition_key(view: &[u8], ctx: &PlacementContext) -> RecognitionKey {
    let start = ctx.offset.saturating_sub(RECOGNITION_KEY_BEFORE).min(view.len());
    let end = ctx.offset.saturating_add(RECOGNITION_KEY_AFTER).min(view.len());
    (ctx.game, ctx.address(), md5::compute(&view[start..end]).0)
}

/// Recognition results and helper bodies for the loaded image.
#[derive(Clone, Debug, Default)]
pub struct EventCache {
    helpers: HashMap<(Game, String), Vec<u8>>,
    recognized: HashMap<RecognitionKey, Option<EventInstance>>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn helper(&self, game: Game, id: &str) -> Option<&[u8]> {
        self.helpers
            .get(&(game, id.to_string()))
            .map(Vec::as_slice)
    }

    pub fn store_helper(&mut self, game: Game, id: &str, body: Vec<u8>) {
        self.helpers.insert((game, id.to_string()), body);
    }

    pub fn clear(&mut self) {
        self.helpers.clear();
        self.recognized.clear();
    }

    /// Forgets recognition results but keeps helper bodies.
    pub fn clear_recognized(&mut self) {
        self.recognized.clear();
    }

    pub fn recognized_len(&self) -> usize {
        self.recognized.len()
    }
}

/// A kind of space event.
pub trait EventDefinition {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn activation(&self) -> ActivationType;
    fn execution(&self) -> ExecutionType;
    fn supported_games(&self) -> &[Game];

    /// Emitted once per game per pass; later placements reuse the address.
    fn shared_asm(&self) -> bool {
        false
    }

    fn custom(&self) -> bool {
        false
    }

    fn parameters(&self) -> &[EventParameter] {
        &[]
    }

    /// Number of halfword arguments stored in front of the code.
    fn inline_args(&self) -> usize {
        0
    }

    /// Identifies an existing handler at `ctx.offset` in `view`.
    fn recognize(
        &self,
        view: &[u8],
        ctx: &PlacementContext,
        cache: &mut EventCache,
    ) -> Option<EventInstance>;

    /// Generates the code for `instance` placed at `ctx.address()`.
    fn assemble(
        &self,
        instance: &EventInstance,
        ctx: &PlacementContext,
        scratch: &mut WriteScratch,
        cache: &EventCache,
    ) -> Result<Vec<u8>>;

    /// Writes the code at `ctx.offset` and returns its length.
    fn write(
        &self,
        buf: &mut [u8],
        instance: &EventInstance,
        ctx: &PlacementContext,
        scratch: &mut WriteScratch,
        cache: &EventCache,
    ) -> Result<usize> {
        let code = self.assemble(instance, ctx, scratch, cache)?;
        place(buf, ctx.offset, &code, self.id())?;
        Ok(code.len())
    }

    /// Length of the code `write` would produce, argument block excluded.
    fn size_of(
        &self,
        instance: &EventInstance,
        ctx: &PlacementContext,
        cache: &EventCache,
    ) -> Result<usize> {
        Ok(self
            .assemble(instance, ctx, &mut WriteScratch::new(), cache)?
            .len())
    }

    fn supports(&self, game: Game) -> bool {
        self.supported_games().contains(&game)
    }
}

fn place(buf: &mut [u8], offset: usize, bytes: &[u8], id: &str) -> Result<()> {
    let buf_len = buf.len();
    let dest = buf
        .get_mut(offset..offset + bytes.len())
        .ok_or_else(|| {
            RomError::Capacity(format!(
                "event {id} needs {} bytes at {offset:#X}, the region ends at {:#X}",
                bytes.len(),
                buf_len
            ))
        })?;
    dest.copy_from_slice(bytes);
    Ok(())
}

/// Bytes taken by `count` inline halfword arguments.
pub fn arg_block_len(count: usize) -> usize {
    (count * 2 + 3) & !3
}

/// Address and length of a written event, argument block included.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EventPlacement {
    pub address: u32,
    pub length: usize,
}

#[derive(Clone, Default)]
pub struct EventRegistry {
    defs: HashMap<String, Arc<dyn EventDefinition>>,
    order: Vec<String>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("events", &self.order)
            .finish()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in definition.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        for def in builtin::definitions()? {
            registry.register(def)?;
        }
        Ok(registry)
    }

    /// Adds a definition. A user-authored event may replace an earlier
    /// user-authored event of the same id; built-ins are never replaced.
    pub fn register(&mut self, def: Arc<dyn EventDefinition>) -> Result<()> {
        let id = def.id().to_string();
        if let Some(existing) = self.defs.get(&id) {
            if !(existing.custom() && def.custom()) {
                return Err(RomError::Config(format!("event {id} is already registered")));
            }
        } else {
            self.order.push(id.clone());
        }
        debug!("registered event {id}");
        self.defs.insert(id, def);
        Ok(())
    }

    pub fn unregister(&mut self, id: &str) -> Option<Arc<dyn EventDefinition>> {
        self.order.retain(|o| o != id);
        self.defs.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn EventDefinition>> {
        self.defs.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Definitions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EventDefinition>> {
        self.order.iter().filter_map(move |id| self.defs.get(id))
    }

    /// Builds an instance after checking the id and argument count.
    pub fn create(&self, id: &str, args: Vec<i16>) -> Result<EventInstance> {
        let def = self
            .get(id)
            .ok_or_else(|| RomError::UnknownEvent(id.to_string()))?;
        if args.len() != def.inline_args() {
            return Err(RomError::Config(format!(
                "event {id} takes {} arguments, got {}",
                def.inline_args(),
                args.len()
            )));
        }
        Ok(EventInstance::new(id, args))
    }

    /// Tries every definition available for `ctx.game`. A miss is `None`.
    pub fn recognize(
        &self,
        view: &[u8],
        ctx: &PlacementContext,
        cache: &mut EventCache,
    ) -> Option<EventInstance> {
        let key = recognition_key(view, ctx);
        if let Some(hit) = cache.recognized.get(&key) {
            return hit.clone();
        }

        let found = self
            .iter()
            .filter(|def| def.supports(ctx.game))
            .find_map(|def| def.recognize(view, ctx, cache))
            .map(|mut instance| {
                instance.state = PlacementState::Recognized;
                instance
            });

        match &found {
            Some(instance) => trace!("{:#X}: recognized {}", key.1, instance.id),
            None => trace!("{:#X}: no definition matched", key.1),
        }
        cache.recognized.insert(key, found.clone());
        found
    }
}

/// Writes `instance` at `ctx.offset`: inline arguments first, then the code.
pub fn write_event(
    buf: &mut [u8],
    registry: &EventRegistry,
    instance: &mut EventInstance,
    ctx: &PlacementContext,
    scratch: &mut WriteScratch,
    cache: &EventCache,
) -> Result<EventPlacement> {
    let def = registry
        .get(&instance.id)
        .ok_or_else(|| RomError::UnknownEvent(instance.id.clone()))?;
    if !def.supports(ctx.game) {
        return Err(RomError::UnsupportedTarget {
            target: format!("{} on {}", instance.id, ctx.game),
            feature: "this event",
        });
    }

    if def.shared_asm() {
        if let Some(address) = scratch.shared_address(ctx.game, def.id()) {
            instance.state = PlacementState::Written;
            return Ok(EventPlacement { address, length: 0 });
        }
    }

    if instance.args.len() != def.inline_args() {
        return Err(RomError::Config(format!(
            "event {} takes {} arguments, got {}",
            instance.id,
            def.inline_args(),
            instance.args.len()
        )));
    }

    let block_len = arg_block_len(instance.args.len());
    let mut block = vec![0u8; block_len];
    for (i, arg) in instance.args.iter().enumerate() {
        block[i * 2..i * 2 + 2].copy_from_slice(&arg.to_be_bytes());
    }
    place(buf, ctx.offset, &block, def.id())?;

    let code_ctx = ctx.advanced(block_len);
    let code = def.assemble(instance, &code_ctx, scratch, cache)?;
    instance.state = PlacementState::Assembled;
    place(buf, code_ctx.offset, &code, def.id())?;
    instance.state = PlacementState::Written;

    let address = code_ctx.address();
    if def.shared_asm() {
        scratch.record_shared(ctx.game, def.id(), address);
    }
    trace!(
        "wrote {} at {address:#X} ({} + {} bytes)",
        instance.id,
        block_len,
        code.len()
    );

    Ok(EventPlacement {
        address,
        length: block_len + code.len(),
    })
}

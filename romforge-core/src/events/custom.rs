//! User-authored events: annotated assembly text with `; KEY: value` headers.
//!
//! ```text
//! ; NAME: Lose ten coins
//! ; GAMES: MP2_USA, NMVE
//! ; EXECUTION: Direct
//! ; PARAM: Number|amount
//! addiu sp, sp, -0x18
//! ...
//! ```

use std::sync::Arc;

use log::{debug, warn};

use super::{
    ActivationType, EventCache, EventDefinition, EventInstance, EventParameter, EventRegistry,
    ExecutionType, ParamType, PlacementContext, WriteScratch,
};
use crate::assembler::{assemble, compose_source};
use crate::game::Game;
use crate::symbols::SymbolLookup;
use crate::{RomError, Result};

/// Where test assemblies are placed.
const TEST_ORIGIN: u32 = 0x8040_0000;

#[derive(Clone, Debug, PartialEq)]
pub struct CustomEvent {
    name: String,
    activation: ActivationType,
    execution: ExecutionType,
    games: Vec<Game>,
    parameters: Vec<EventParameter>,
    source: String,
}

fn parse_game(token: &str) -> Option<Game> {
    let t = token.trim().to_ascii_uppercase();
    if let Some(game) = Game::from_id(&t) {
        return Some(game);
    }
    let (generation, region) = t.strip_prefix("MP")?.split_once('_')?;
    let id = match (generation, region) {
        ("1", "USA") => "NLXE",
        ("1", "JPN") => "NLXJ",
        ("1", "PAL") => "NLXP",
        ("2", "USA") => "NMWE",
        ("2", "JPN") => "NMWJ",
        ("2", "PAL") => "NMWP",
        ("3", "USA") => "NMVE",
        ("3", "JPN") => "NMVJ",
        ("3", "PAL") => "NMVP",
        _ => return None,
    };
    Game::from_id(id)
}

fn parse_execution(value: &str) -> Option<ExecutionType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "direct" | "1" => Some(ExecutionType::Direct),
        "process" | "2" => Some(ExecutionType::Process),
        _ => None,
    }
}

fn parse_activation(value: &str) -> Option<ActivationType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "walkover" | "1" => Some(ActivationType::WalkOver),
        "landon" | "2" => Some(ActivationType::LandOn),
        "perturn" | "3" => Some(ActivationType::PerTurn),
        "beginorwalkover" | "8" => Some(ActivationType::BeginOrWalkOver),
        _ => None,
    }
}

fn parse_param(value: &str) -> Option<EventParameter> {
    let (kind, name) = value.split_once('|')?;
    let kind = match kind.trim().to_ascii_lowercase().as_str() {
        "number" => ParamType::Number,
        "positivenumber" => ParamType::PositiveNumber,
        "boolean" => ParamType::Boolean,
        "space" => ParamType::Space,
        _ => return None,
    };
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(EventParameter {
        name: name.to_string(),
        kind,
    })
}

impl CustomEvent {
    /// Reads the headers. The whole text, headers included, is kept as the
    /// assembly body; the headers are comments to the assembler.
    pub fn parse(text: &str) -> Result<Self> {
        let mut name = None;
        let mut games = Vec::new();
        let mut execution = None;
        let mut activation = ActivationType::LandOn;
        let mut parameters = Vec::new();

        for line in text.lines() {
            let Some(header) = line.trim_start().strip_prefix(';') else {
                continue;
            };
            let Some((key, value)) = header.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let bad = |what: &str| RomError::Config(format!("bad {what} header '{value}'"));

            match key.trim().to_ascii_uppercase().as_str() {
                "NAME" => name = Some(value.to_string()),
                "GAMES" => {
                    for token in value.split(',').filter(|t| !t.trim().is_empty()) {
                        let game = parse_game(token).ok_or_else(|| bad("GAMES"))?;
                        if !games.contains(&game) {
                            games.push(game);
                        }
                    }
                }
                "EXECUTION" => {
                    execution = Some(parse_execution(value).ok_or_else(|| bad("EXECUTION"))?);
                }
                "ACTIVATION" => {
                    activation = parse_activation(value).ok_or_else(|| bad("ACTIVATION"))?;
                }
                "PARAM" => {
                    let param = parse_param(value).ok_or_else(|| bad("PARAM"))?;
                    if parameters.iter().any(|p: &EventParameter| p.name == param.name) {
                        return Err(RomError::Config(format!(
                            "parameter {} is declared twice",
                            param.name
                        )));
                    }
                    parameters.push(param);
                }
                _ => {}
            }
        }

        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RomError::Config("custom event has no NAME header".to_string()))?;
        if games.is_empty() {
            return Err(RomError::Config(format!("custom event {name} has no GAMES header")));
        }
        let execution = execution.ok_or_else(|| {
            RomError::Config(format!("custom event {name} has no EXECUTION header"))
        })?;

        Ok(Self {
            name,
            activation,
            execution,
            games,
            parameters,
            source: text.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn param_value(&self, param: &EventParameter, instance: &EventInstance) -> Result<u32> {
        let value = instance.params.get(&param.name).copied().unwrap_or(0);
        let ok = match param.kind {
            ParamType::Number => i32::try_from(value).is_ok(),
            ParamType::PositiveNumber => (0..=u32::MAX as i64).contains(&value),
            ParamType::Boolean => value == 0 || value == 1,
            ParamType::Space => (0..0xFFFF).contains(&value),
        };
        if !ok {
            return Err(RomError::Config(format!(
                "event {}: parameter {} cannot be {value}",
                self.name, param.name
            )));
        }
        Ok(value as u32)
    }

    fn assemble_at(
        &self,
        game: Game,
        origin: u32,
        symbols: &dyn SymbolLookup,
        instance: &EventInstance,
    ) -> Result<Vec<u8>> {
        let mut defines: Vec<(String, u32)> = symbols
            .symbols(game)
            .iter()
            .map(|s| (s.name.clone(), s.addr))
            .collect();
        for param in &self.parameters {
            defines.push((param.name.clone(), self.param_value(param, instance)?));
        }

        let src = compose_source(origin, &defines, &self.source);
        assemble(&src)
            .map(|out| out.bytes)
            .map_err(|err| RomError::Assembly {
                game,
                message: format!("event {}: {err}", self.name),
            })
    }

    /// Assembles once per claimed game with every parameter at zero.
    pub fn test_assemble(&self, symbols: &dyn SymbolLookup) -> Result<()> {
        let instance = EventInstance::new(self.name.clone(), Vec::new());
        for &game in &self.games {
            let bytes = self.assemble_at(game, TEST_ORIGIN, symbols, &instance)?;
            debug!("{} assembles to {} bytes for {game}", self.name, bytes.len());
        }
        Ok(())
    }
}

impl EventDefinition for CustomEvent {
    fn id(&self) -> &str {
        &self.name
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn activation(&self) -> ActivationType {
        self.activation
    }

    fn execution(&self) -> ExecutionType {
        self.execution
    }

    fn supported_games(&self) -> &[Game] {
        &self.games
    }

    fn custom(&self) -> bool {
        true
    }

    fn parameters(&self) -> &[EventParameter] {
        &self.parameters
    }

    /// Free-form code has no fixed shape to look for.
    fn recognize(
        &self,
        _view: &[u8],
        _ctx: &PlacementContext,
        _cache: &mut EventCache,
    ) -> Option<EventInstance> {
        None
    }

    fn assemble(
        &self,
        instance: &EventInstance,
        ctx: &PlacementContext,
        _scratch: &mut WriteScratch,
        _cache: &EventCache,
    ) -> Result<Vec<u8>> {
        self.assemble_at(ctx.game, ctx.address(), ctx.symbols, instance)
    }
}

impl EventRegistry {
    /// Parses, test-assembles for every claimed game, then registers.
    /// Nothing is registered when any game fails.
    pub fn register_custom(&mut self, text: &str, symbols: &dyn SymbolLookup) -> Result<()> {
        let event = CustomEvent::parse(text)?;
        if let Err(err) = event.test_assemble(symbols) {
            warn!("rejected custom event {}: {err}", event.name);
            return Err(err);
        }
        self.register(Arc::new(event))
    }
}

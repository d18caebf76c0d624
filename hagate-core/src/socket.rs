//! Gating of Home Assistant WebSocket API commands.
//!
//! The upgrade request for `/api/websocket` goes through
//! [`ModeController::evaluate`] like any other request. After that every text
//! frame the client sends goes through [`ModeController::evaluate_frame`];
//! frames from Home Assistant are relayed as they are.
//!
//! In learn mode frames are always forwarded, and entities targeted by
//! `call_service` commands are recorded. In limit mode a command is refused
//! when:
//!
//! - its `type` is a blocked command (template rendering, event firing,
//!   script execution, automation/script/scene config, supervisor, backups,
//!   token management)
//! - it is `subscribe_events` without an `event_type`, or for an event type
//!   outside the metadata/state set
//! - it is a `call_service` for a blocked service, or one that names an
//!   entity the whitelist does not cover
//! - it is a `call_service` that targets a device or area; the whitelist holds
//!   entities only
//! - it is a `call_service` in an entity-controlled domain with no target,
//!   which Home Assistant would apply to every entity in the domain
//!
//! A refused command never reaches Home Assistant. The client gets a
//! `result` frame with `success: false` and error code `not_allowed` under
//! the command's `id`. Frames that are not JSON are forwarded for Home
//! Assistant to reject.

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::extract::{EntitySet, TARGET_FIELD};
use crate::mode::{Mode, ModeController};

/// Error code Home Assistant clients see on a refused command.
pub const NOT_ALLOWED_CODE: &str = "not_allowed";

/// Command types that are always allowed, even under a blocked prefix.
const ALLOWED_COMMANDS: &[&str] = &["auth/current_user", "lovelace/config", "lovelace/resources"];

const BLOCKED_COMMANDS: &[&str] = &[
    "render_template",
    "fire_event",
    "execute_script",
    "subscribe_trigger",
    "intent/handle",
    "auth/sign_path",
];

const BLOCKED_COMMAND_PREFIXES: &[&str] = &[
    "config/automation/",
    "config/script/",
    "config/scene/",
    "config_entries/",
    "hassio/",
    "backup/",
    "auth/refresh_token",
    "auth/delete_refresh_token",
];

/// Event types a client may subscribe to.
const SUBSCRIBABLE_EVENTS: &[&str] = &[
    "state_changed",
    "component_loaded",
    "service_registered",
    "service_removed",
    "themes_updated",
    "panels_updated",
    "lovelace_updated",
    "core_config_updated",
    "entity_registry_updated",
    "device_registry_updated",
    "area_registry_updated",
    "floor_registry_updated",
    "label_registry_updated",
    "repairs_issue_registry_updated",
];

/// `(domain, service)` pairs refused outright; `*` covers the whole domain.
const BLOCKED_SERVICES: &[(&str, &str)] = &[
    ("homeassistant", "restart"),
    ("homeassistant", "stop"),
    ("homeassistant", "reload_all"),
    ("homeassistant", "reload_core_config"),
    ("homeassistant", "reload_config_entry"),
    ("homeassistant", "set_location"),
    ("automation", "trigger"),
    ("automation", "reload"),
    ("automation", "turn_on"),
    ("automation", "turn_off"),
    ("automation", "toggle"),
    ("script", "reload"),
    ("script", "turn_on"),
    ("script", "turn_off"),
    ("script", "toggle"),
    ("scene", "reload"),
    ("scene", "apply"),
    ("scene", "create"),
    ("input_boolean", "reload"),
    ("input_number", "reload"),
    ("input_select", "reload"),
    ("input_text", "reload"),
    ("input_datetime", "reload"),
    ("input_button", "reload"),
    ("shell_command", "*"),
    ("python_script", "*"),
    ("pyscript", "*"),
    ("rest_command", "*"),
    ("notify", "*"),
    ("persistent_notification", "create"),
    ("system_log", "clear"),
    ("recorder", "purge"),
    ("recorder", "purge_entities"),
    ("recorder", "disable"),
    ("recorder", "enable"),
    ("logger", "set_level"),
    ("logger", "set_default_level"),
];

/// Domains whose services act on every entity in the domain when no target
/// is given.
const ENTITY_CONTROLLED_DOMAINS: &[&str] = &[
    "light",
    "switch",
    "cover",
    "fan",
    "climate",
    "media_player",
    "vacuum",
    "lock",
    "alarm_control_panel",
    "camera",
    "humidifier",
    "water_heater",
    "remote",
    "button",
    "number",
    "select",
    "siren",
    "text",
    "valve",
    "lawn_mower",
    "update",
];

/// What to do with one client text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameVerdict {
    /// Text to send to Home Assistant, if any command survived.
    pub forward: Option<String>,
    /// Error results to send back to the client, one per refused command.
    pub replies: Vec<String>,
}

impl FrameVerdict {
    fn pass(text: &str) -> Self {
        Self {
            forward: Some(text.to_string()),
            replies: Vec::new(),
        }
    }
}

/// A refused command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDenial {
    /// The command's `id`, echoed in the reply.
    pub id: Value,
    pub message: String,
}

impl CommandDenial {
    fn new(command: &Value, message: String) -> Self {
        Self {
            id: command.get("id").cloned().unwrap_or(Value::Null),
            message,
        }
    }

    /// The `result` frame sent back to the client.
    #[must_use]
    pub fn reply(&self) -> String {
        json!({
            "id": self.id,
            "type": "result",
            "success": false,
            "error": { "code": NOT_ALLOWED_CODE, "message": self.message },
        })
        .to_string()
    }
}

/// Identifiers a `call_service` command targets, from `service_data` and
/// `target`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandTargets {
    pub entities: Vec<String>,
    pub devices: Vec<String>,
    pub areas: Vec<String>,
}

impl CommandTargets {
    #[must_use]
    pub fn decode(command: &Value) -> Self {
        let mut targets = Self::default();
        for container in ["service_data", "target"]
            .into_iter()
            .filter_map(|key| command.get(key))
            .filter(|c| c.is_object())
        {
            collect_strings(container.get(TARGET_FIELD), &mut targets.entities);
            collect_strings(container.get("device_id"), &mut targets.devices);
            collect_strings(container.get("area_id"), &mut targets.areas);
        }
        targets
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.devices.is_empty() && self.areas.is_empty()
    }
}

fn collect_strings(field: Option<&Value>, out: &mut Vec<String>) {
    match field {
        Some(Value::String(s)) => out.push(s.clone()),
        Some(Value::Array(items)) => out.extend(items.iter().filter_map(Value::as_str).map(str::to_string)),
        _ => {}
    }
}

fn is_blocked_command(kind: &str) -> bool {
    if ALLOWED_COMMANDS.contains(&kind) {
        return false;
    }
    BLOCKED_COMMANDS.contains(&kind) || BLOCKED_COMMAND_PREFIXES.iter().any(|p| kind.starts_with(p))
}

fn is_blocked_service(domain: &str, service: &str) -> bool {
    BLOCKED_SERVICES
        .iter()
        .any(|&(d, s)| d == domain && (s == service || s == "*"))
}

impl ModeController {
    /// Decide what happens to one client text frame on `/api/websocket`.
    ///
    /// A frame holds one command object or an array of them. For arrays each
    /// command is judged separately and only the allowed ones are forwarded.
    pub fn evaluate_frame(&self, text: &str) -> FrameVerdict {
        let Ok(parsed) = serde_json::from_str::<Value>(text) else {
            debug!("WebSocket frame is not JSON, forwarding");
            return FrameVerdict::pass(text);
        };

        match parsed {
            Value::Array(commands) => {
                let mut kept = Vec::with_capacity(commands.len());
                let mut replies = Vec::new();
                for command in commands {
                    match self.evaluate_command(&command) {
                        Ok(()) => kept.push(command),
                        Err(denial) => replies.push(denial.reply()),
                    }
                }
                let forward = if replies.is_empty() {
                    Some(text.to_string())
                } else if kept.is_empty() {
                    None
                } else {
                    Some(Value::Array(kept).to_string())
                };
                FrameVerdict { forward, replies }
            }
            command => match self.evaluate_command(&command) {
                Ok(()) => FrameVerdict::pass(text),
                Err(denial) => FrameVerdict {
                    forward: None,
                    replies: vec![denial.reply()],
                },
            },
        }
    }

    /// Judge one command object.
    ///
    /// # Errors
    ///
    /// Returns the denial when limit mode refuses the command.
    pub fn evaluate_command(&self, command: &Value) -> Result<(), CommandDenial> {
        let verdict = match self.mode() {
            Mode::Learn => {
                self.learn_command(command);
                Ok(())
            }
            Mode::Limit => self.limit_command(command),
        };

        if let Some(metrics) = self.metrics() {
            metrics.record_request(self.mode().as_str(), if verdict.is_ok() { "allow" } else { "deny" });
            if verdict.is_err() {
                metrics.record_denial("command");
            }
        }
        verdict
    }

    fn learn_command(&self, command: &Value) {
        if command.get("type").and_then(Value::as_str) != Some("call_service") {
            return;
        }
        let targets = CommandTargets::decode(command);
        let requested: EntitySet = targets.entities.into_iter().collect();
        let added = self.store().record_entities(&requested);
        for entity in &added {
            info!(entity = %entity, source = "websocket", "Learned new entity");
        }
        if let Some(metrics) = self.metrics()
            && !added.is_empty()
        {
            metrics.record_learned("entity", added.len() as u64);
            let (endpoints, entities) = self.store().counts();
            metrics.set_whitelist_entries(endpoints, entities);
        }
    }

    fn limit_command(&self, command: &Value) -> Result<(), CommandDenial> {
        let Some(kind) = command.get("type").and_then(Value::as_str) else {
            return Ok(());
        };

        if is_blocked_command(kind) {
            warn!(command = %kind, "Blocked WebSocket command");
            return Err(CommandDenial::new(command, format!("Message type not allowed: {kind}")));
        }

        match kind {
            "subscribe_events" => check_subscription(command),
            "call_service" => self.check_service_call(command),
            _ => Ok(()),
        }
    }

    fn check_service_call(&self, command: &Value) -> Result<(), CommandDenial> {
        let domain = command.get("domain").and_then(Value::as_str).unwrap_or_default();
        let service = command.get("service").and_then(Value::as_str).unwrap_or_default();

        if is_blocked_service(domain, service) {
            warn!(domain = %domain, service = %service, "Blocked WebSocket service");
            return Err(CommandDenial::new(
                command,
                format!("Service not allowed: {domain}.{service}"),
            ));
        }

        let targets = CommandTargets::decode(command);
        let unmatched = self
            .store()
            .read(|w| w.first_unmatched_entity(&targets.entities).cloned());
        if let Some(entity) = unmatched {
            warn!(domain = %domain, service = %service, entity = %entity, "Blocked WebSocket service call");
            return Err(CommandDenial::new(command, format!("Entity not in whitelist: {entity}")));
        }
        if let Some(device) = targets.devices.first() {
            warn!(domain = %domain, service = %service, device = %device, "Blocked WebSocket service call");
            return Err(CommandDenial::new(command, format!("Device not in whitelist: {device}")));
        }
        if let Some(area) = targets.areas.first() {
            warn!(domain = %domain, service = %service, area = %area, "Blocked WebSocket service call");
            return Err(CommandDenial::new(command, format!("Area not in whitelist: {area}")));
        }

        if targets.is_empty() && ENTITY_CONTROLLED_DOMAINS.contains(&domain) {
            warn!(domain = %domain, service = %service, "Blocked untargeted WebSocket service call");
            return Err(CommandDenial::new(
                command,
                format!("Service {domain}.{service} requires explicit targets"),
            ));
        }
        Ok(())
    }
}

fn check_subscription(command: &Value) -> Result<(), CommandDenial> {
    match command.get("event_type").and_then(Value::as_str) {
        None => {
            warn!("Blocked subscribe_events without event_type");
            Err(CommandDenial::new(
                command,
                "subscribe_events requires event_type parameter".to_string(),
            ))
        }
        Some(event) if SUBSCRIBABLE_EVENTS.contains(&event) => Ok(()),
        Some(event) => {
            warn!(event_type = %event, "Blocked subscribe_events");
            Err(CommandDenial::new(command, format!("Event type not allowed: {event}")))
        }
    }
}

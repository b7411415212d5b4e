//! minimal bevy + bevy_gemini_chat chat widget (native window or browser canvas).
//! - title, message bubbles, prompt line and a send button.
//! - enter or the button submits; the prompt clears right away.
//! - bubbles are rebuilt from the session `History` whenever it changes.
//!
//! env (native):
//!   GEMINI_API_KEY   (key)
//!   GEMINI_ENDPOINT  (default https://generativelanguage.googleapis.com)
//!   GEMINI_MODEL     (default gemini-2.0-flash)
//! web: the same values come from the page url, e.g. `index.html?key=...`

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_gemini_chat::{
    BOT_MARKER, ChatErrorEvt, ChatSession, ChatStarted, ChatTurnEvt, ERROR_LABEL, GeminiChatPlugin,
    GeminiConfig, History, send_user_text,
};

// only the tail of the history fits on screen
const VISIBLE_TURNS: usize = 12;

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct MessageList;
#[derive(Component)]
struct Bubble;
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct BtnSend;

#[derive(Component, Copy, Clone)]
struct TargetSession(Entity);

// ---------------------- app state ----------------------

#[derive(Resource, Default)]
struct PromptBuf(String);

#[derive(Resource, Default)]
struct Waiting(usize);

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let config = GeminiConfig::from_env();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(config)
        .insert_resource(PromptBuf::default())
        .insert_resource(Waiting::default())
        .add_plugins(DefaultPlugins.set(WindowPlugin {
            primary_window: Some(Window {
                title: "AI Chat Assistant".to_string(),
                fit_canvas_to_parent: true,
                ..default()
            }),
            ..default()
        }))
        .add_plugins(GeminiChatPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, btn_send, refresh_prompt_text))
        // event readers should run after bevy_gemini_chat emits events
        .add_systems(
            Update,
            (on_started, on_turn, on_error, render_history).after(bevy_gemini_chat::ChatSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands, config: Res<GeminiConfig>) {
    commands.spawn(Camera2d::default());

    let session = commands.spawn(ChatSession::default()).id();

    let style_22 = TextFont { font_size: 22.0, ..default() };
    let style_16 = TextFont { font_size: 16.0, ..default() };
    let style_13 = TextFont { font_size: 13.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            p.spawn((
                Text::new("AI Chat Assistant"),
                style_22.clone(),
                TextColor(Color::srgb(1.0, 0.9, 0.2)),
            ));

            // --- conversation box ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    justify_content: JustifyContent::FlexEnd,
                    row_gap: Val::Px(6.0),
                    padding: UiRect::all(Val::Px(8.0)),
                    overflow: Overflow::clip_y(),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
                MessageList,
                TargetSession(session),
            ));

            p.spawn((
                Text::new(""),
                style_13.clone(),
                TextColor(Color::srgb_u8(160, 160, 160)),
                StatusText,
            ));

            // row: prompt [send]
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    column_gap: Val::Px(8.0),
                    flex_direction: FlexDirection::Row,
                    align_items: AlignItems::Center,
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|row| {
                row.spawn((
                    Node {
                        flex_grow: 1.0,
                        padding: UiRect::all(Val::Px(6.0)),
                        ..default()
                    },
                    BackgroundColor(Color::srgb(0.14, 0.14, 0.17)),
                ))
                .with_children(|b| {
                    b.spawn((
                        Text::new("Type your message..."),
                        style_16.clone(),
                        TextColor(Color::WHITE),
                        PromptText,
                        TargetSession(session),
                    ));
                });

                row.spawn((
                    Button,
                    Node {
                        width: Val::Px(90.0),
                        height: Val::Px(32.0),
                        align_items: AlignItems::Center,
                        justify_content: JustifyContent::Center,
                        ..default()
                    },
                    BackgroundColor(Color::srgb(0.2, 0.2, 0.25)),
                    BtnSend,
                    TargetSession(session),
                ))
                .with_children(|b| {
                    b.spawn((Text::new("Send"), style_16.clone(), TextColor(Color::WHITE)));
                });
            });

            let key_hint = if config.api_key.is_empty() {
                "no api key: set GEMINI_API_KEY (native) or add ?key=... to the page url (web)"
                    .to_string()
            } else {
                format!("model: {}", config.model)
            };
            p.spawn((Text::new(key_hint), style_13.clone(), TextColor(Color::srgb(0.4, 0.6, 1.0))));
        });
}

// ---------------------- input & buttons ----------------------

fn submit_prompt(commands: &mut Commands, prompt: &mut PromptBuf, session: Entity) {
    // empty prompts are sent too; nothing validates user text
    let msg = std::mem::take(&mut prompt.0);
    send_user_text(commands, session, msg);
}

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    q_prompt_target: Query<&TargetSession, With<PromptText>>,
) {
    for ev in ev_kbd.read() {
        if ev.state.is_pressed() {
            if let Some(txt) = &ev.text {
                let s = txt.replace('\r', "").replace('\n', "");
                prompt.0.push_str(&s);
            }
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    if keys.just_pressed(KeyCode::Enter) {
        if let Ok(TargetSession(e)) = q_prompt_target.single() {
            submit_prompt(&mut commands, &mut prompt, *e);
        }
    }
}

fn btn_send(
    mut commands: Commands,
    mut q: Query<
        (&Interaction, &TargetSession, &mut BackgroundColor),
        (Changed<Interaction>, With<BtnSend>),
    >,
    mut prompt: ResMut<PromptBuf>,
) {
    for (i, TargetSession(e), mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.3, 0.3, 0.35);
                submit_prompt(&mut commands, &mut prompt, *e);
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.25, 0.25, 0.3),
            Interaction::None => bg.0 = Color::srgb(0.2, 0.2, 0.25),
        }
    }
}

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q_prompt: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed() {
        if let Ok(mut t) = q_prompt.single_mut() {
            t.0 = if prompt.0.is_empty() {
                "Type your message...".to_string()
            } else {
                format!("{} |", prompt.0)
            };
        }
    }
}

// ---------------------- chat events ----------------------

fn on_started(
    mut ev: EventReader<ChatStarted>,
    mut waiting: ResMut<Waiting>,
    mut q: Query<&mut Text, With<StatusText>>,
) {
    for _ in ev.read() {
        waiting.0 += 1;
    }
    if waiting.is_changed() {
        if let Ok(mut t) = q.single_mut() {
            t.0 = if waiting.0 > 0 { "thinking...".to_string() } else { String::new() };
        }
    }
}

fn on_turn(mut ev: EventReader<ChatTurnEvt>, mut waiting: ResMut<Waiting>) {
    for ChatTurnEvt { entity, request, .. } in ev.read() {
        debug!(target: "chat", "turn appended (entity={:?}, request={})", entity, request);
        waiting.0 = waiting.0.saturating_sub(1);
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>) {
    for ChatErrorEvt { entity, error } in ev.read() {
        warn!(target: "chat", "chat error (entity={:?}): {}", entity, error);
    }
}

fn bubble(parent: &mut ChildSpawnerCommands, text: &str, align: AlignSelf, bg: Color) {
    parent
        .spawn((
            Node {
                max_width: Val::Percent(80.0),
                align_self: align,
                padding: UiRect::axes(Val::Px(10.0), Val::Px(6.0)),
                ..default()
            },
            BackgroundColor(bg),
            BorderRadius::all(Val::Px(8.0)),
            Bubble,
        ))
        .with_children(|b| {
            b.spawn((
                Text::new(text),
                TextFont { font_size: 16.0, ..default() },
                TextColor(Color::WHITE),
            ));
        });
}

/// alternating bubbles: user on the right, bot (or error) on the left.
fn render_history(
    mut commands: Commands,
    q_hist: Query<Ref<History>>,
    q_list: Query<(Entity, &TargetSession), With<MessageList>>,
    q_bubbles: Query<Entity, With<Bubble>>,
) {
    let Ok((list, TargetSession(session))) = q_list.single() else {
        return;
    };
    let Ok(history) = q_hist.get(*session) else {
        return;
    };
    if !history.is_changed() {
        return;
    }

    for b in &q_bubbles {
        commands.entity(b).despawn();
    }

    let skip = history.len().saturating_sub(VISIBLE_TURNS);
    commands.entity(list).with_children(|c| {
        for turn in history.iter().skip(skip) {
            let failed = turn.user == ERROR_LABEL && !turn.reply.starts_with(BOT_MARKER);
            if !failed {
                bubble(c, &turn.user, AlignSelf::FlexEnd, Color::srgb(0.18, 0.32, 0.55));
            }
            let bg = if failed {
                Color::srgb(0.45, 0.12, 0.12)
            } else {
                Color::srgb(0.22, 0.22, 0.26)
            };
            let reply = if failed {
                format!("{} {}", turn.user, turn.reply)
            } else {
                turn.reply.clone()
            };
            bubble(c, &reply, AlignSelf::FlexStart, bg);
        }
    });
}

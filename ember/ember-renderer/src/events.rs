//! Window events as the engine sees them, and the loop state machine they drive.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Escape,
    Left,
    Right,
    Up,
    Down,
    Space,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    CloseRequested,
    Minimized,
    Restored,
    KeyPressed(Key),
    /// Informational only. Resizing is driven by a stale swapchain, never by this event.
    Resized { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Minimized: no frames are drawn.
    Suspended,
    /// The swapchain went stale; rebuild it before the next frame.
    ResizePending,
    Quitting,
}

/// What the caller's loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    /// Nothing was drawn; sleep for a while before the next tick.
    Throttle,
    Exit,
}

/// Result of applying one event to the loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEffect {
    None,
    /// The key is not consumed by the loop; forward it to the overlay.
    ForwardKey(Key),
}

impl LoopState {
    /// Apply `event`. A pending resize survives minimize/restore.
    pub fn on_event(&mut self, event: EngineEvent) -> EventEffect {
        match event {
            EngineEvent::CloseRequested | EngineEvent::KeyPressed(Key::Escape) => {
                log::info!("exit requested");
                *self = LoopState::Quitting;
            }
            _ if *self == LoopState::Quitting => {}
            EngineEvent::Minimized => {
                log::debug!("stop rendering");
                if *self == LoopState::Running {
                    *self = LoopState::Suspended;
                }
            }
            EngineEvent::Restored => {
                log::debug!("resume rendering");
                if *self == LoopState::Suspended {
                    *self = LoopState::Running;
                }
            }
            EngineEvent::KeyPressed(key) => {
                log::trace!("key pressed: {:?}", key);
                return EventEffect::ForwardKey(key);
            }
            EngineEvent::Resized { width, height } => {
                log::debug!("window resized to {}x{}", width, height);
            }
        }
        EventEffect::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_and_close_quit() {
        let mut state = LoopState::Running;
        state.on_event(EngineEvent::KeyPressed(Key::Escape));
        assert_eq!(state, LoopState::Quitting);

        let mut state = LoopState::ResizePending;
        state.on_event(EngineEvent::CloseRequested);
        assert_eq!(state, LoopState::Quitting);
    }

    #[test]
    fn minimize_suspends_and_restore_resumes() {
        let mut state = LoopState::Running;
        state.on_event(EngineEvent::Minimized);
        assert_eq!(state, LoopState::Suspended);
        state.on_event(EngineEvent::Restored);
        assert_eq!(state, LoopState::Running);
    }

    #[test]
    fn pending_resize_is_not_lost() {
        let mut state = LoopState::ResizePending;
        state.on_event(EngineEvent::Minimized);
        state.on_event(EngineEvent::Restored);
        state.on_event(EngineEvent::Resized { width: 10, height: 10 });
        assert_eq!(state, LoopState::ResizePending);
    }

    #[test]
    fn other_keys_are_forwarded() {
        let mut state = LoopState::Running;
        assert_eq!(
            state.on_event(EngineEvent::KeyPressed(Key::Left)),
            EventEffect::ForwardKey(Key::Left)
        );
        assert_eq!(state, LoopState::Running);
    }

    #[test]
    fn quitting_is_terminal() {
        let mut state = LoopState::Quitting;
        state.on_event(EngineEvent::Restored);
        assert_eq!(state.on_event(EngineEvent::KeyPressed(Key::Up)), EventEffect::None);
        assert_eq!(state, LoopState::Quitting);
    }
}

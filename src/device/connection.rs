use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::{channel, unbounded, Sender, UnboundedReceiver};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::device::constants::COMMAND_CHANNEL_SIZE;
use crate::device::radio::{RadioEventSender, RadioFactory, RadioMessage};
use crate::device::session::{Session, SessionOptions, Timer};
use crate::device::types::{DeviceId, PublishedState, SessionCommand};

/// Creates the channel a radio factory reports on and the session task listens to.
pub fn radio_channel() -> (RadioEventSender, UnboundedReceiver<RadioMessage>) {
    unbounded()
}

/// Front end side of a running session: send commands, observe state.
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    state: watch::Receiver<PublishedState>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> watch::Receiver<PublishedState> {
        self.state.clone()
    }

    pub fn state(&self) -> PublishedState {
        self.state.borrow().clone()
    }

    pub async fn start_scan(&mut self) {
        self.send(SessionCommand::StartScan).await
    }

    pub async fn stop_scan(&mut self) {
        self.send(SessionCommand::StopScan).await
    }

    pub async fn restart_scan(&mut self) {
        self.send(SessionCommand::RestartScan).await
    }

    pub async fn select_device(&mut self, id: DeviceId) {
        self.send(SessionCommand::SelectDevice(id)).await
    }

    pub async fn disconnect(&mut self) {
        self.send(SessionCommand::Disconnect).await
    }

    // a stopped session has nothing left to act on, so the command is dropped like any other
    // inapplicable command
    async fn send(&mut self, command: SessionCommand) {
        if let Err(err) = self.commands.send(command).await {
            warn!("Session is not running, dropping command: {:?}", err);
        }
    }
}

/// Runs `Session` on its own task. Commands, radio events and timers are handled strictly one
/// after the other on that task.
pub fn spawn_session<F>(
    cancel: CancellationToken,
    factory: F,
    mut radio_events: UnboundedReceiver<RadioMessage>,
    options: SessionOptions,
) -> (SessionHandle, JoinHandle<()>)
where
    F: RadioFactory + 'static,
{
    let (command_sender, mut command_receiver) = channel::<SessionCommand>(COMMAND_CHANNEL_SIZE);
    let (session, state) = Session::new(factory, options);

    let handle = spawn(async move {
        let mut session = session;
        let (timer_sender, mut timer_receiver) = unbounded::<Timer>();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(command) = command_receiver.next() => {
                    session.handle_command(command);
                },
                Some(message) = radio_events.next() => {
                    session.handle_radio(message);
                },
                Some(timer) = timer_receiver.next() => {
                    session.handle_timer(timer);
                },
            }

            // fire-and-forget; a timer firing after a newer reset finds an already reset state
            for scheduled in session.take_timers() {
                let timer_sender = timer_sender.clone();
                spawn(async move {
                    sleep(scheduled.delay).await;
                    if timer_sender.unbounded_send(scheduled.timer).is_err() {
                        debug!("Session stopped before timer {:?} fired", scheduled.timer);
                    }
                });
            }
        }

        info!("Session stopped");
    });

    (SessionHandle { commands: command_sender, state }, handle)
}

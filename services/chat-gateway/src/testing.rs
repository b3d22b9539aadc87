//! Scripted upstream used by the service's tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use upstream::{
    Fragment, FragmentReceiver, Message, Result, Role, SessionAdapter, UpstreamError,
};

pub enum Reply {
    /// Blocking answer.
    Answer(String),
    /// Fragments delivered at once, after which the producer hangs up.
    Fragments(Vec<Fragment>),
    /// Stream opens but nothing ever arrives.
    Silent,
    /// Exchange refused with this message.
    Fail(String),
}

pub struct ScriptedAdapter {
    reply: Reply,
    calls: AtomicUsize,
    last_bot: Mutex<Option<String>>,
    last_token: Mutex<Option<String>>,
}

impl ScriptedAdapter {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
            last_bot: Mutex::new(None),
            last_token: Mutex::new(None),
        }
    }

    pub fn text(parts: &[&str]) -> Self {
        let mut fragments: Vec<Fragment> =
            parts.iter().map(|p| Fragment::Text(p.to_string())).collect();
        fragments.push(Fragment::Done);
        Self::new(Reply::Fragments(fragments))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_bot(&self) -> Option<String> {
        self.last_bot.lock().unwrap().clone()
    }

    pub fn last_token(&self) -> Option<String> {
        self.last_token.lock().unwrap().clone()
    }

    fn note(&self, token: &str, bot: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_bot.lock().unwrap() = Some(bot.to_string());
        *self.last_token.lock().unwrap() = Some(token.to_string());
    }

    fn refused(message: &str) -> UpstreamError {
        UpstreamError::Status {
            status: 500,
            message: message.to_string(),
        }
    }
}

impl SessionAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        "scripted"
    }

    fn ask<'a>(
        &'a self,
        token: &'a str,
        _messages: &'a [Message],
        bot: &'a str,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<Message>> + Send + 'a>> {
        Box::pin(async move {
            self.note(token, bot);
            match &self.reply {
                Reply::Answer(text) => Ok(Message::new(Role::Assistant, text.clone())),
                Reply::Fail(message) => Err(Self::refused(message)),
                _ => Err(UpstreamError::Protocol("no blocking reply scripted".into())),
            }
        })
    }

    fn stream<'a>(
        &'a self,
        token: &'a str,
        _messages: &'a [Message],
        bot: &'a str,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<FragmentReceiver>> + Send + 'a>> {
        Box::pin(async move {
            self.note(token, bot);
            match &self.reply {
                Reply::Fragments(fragments) => {
                    let (tx, rx) = mpsc::channel(fragments.len().max(1));
                    for fragment in fragments {
                        tx.try_send(fragment.clone()).unwrap();
                    }
                    Ok(rx)
                }
                Reply::Silent => {
                    // The producer outlives the adapter and hangs up only
                    // once the relay drops its receiver.
                    let (tx, rx) = mpsc::channel::<Fragment>(1);
                    tokio::spawn(async move { tx.closed().await });
                    Ok(rx)
                }
                Reply::Fail(message) => Err(Self::refused(message)),
                Reply::Answer(_) => Err(UpstreamError::Protocol("no stream scripted".into())),
            }
        })
    }
}

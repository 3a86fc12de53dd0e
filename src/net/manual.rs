//! Interactive manual network entry.
//!
//! Entered when automatic resolution fails. Prompting sits behind the
//! [`NetworkPrompt`] trait so automated contexts and tests can script the
//! answers; the interactive implementation uses `inquire`.

use super::{AddressEntry, Route};
use crate::errors::{VmforgeError, VmforgeResult};
use inquire::validator::Validation;
use inquire::{Confirm, Text};
use std::net::Ipv4Addr;

/// Operator prompting capability used by the resolver.
pub trait NetworkPrompt: Send + Sync {
    fn confirm(&self, message: &str) -> VmforgeResult<bool>;

    /// Netmask for an address. Required, strict dotted-quad.
    fn netmask_for(&self, address: Ipv4Addr) -> VmforgeResult<Ipv4Addr>;

    /// Gateway for an address. Optional, blank permitted.
    fn gateway_for(&self, address: Ipv4Addr) -> VmforgeResult<Option<Ipv4Addr>>;

    /// Next extra static route; `None` when the operator leaves the
    /// destination blank.
    fn next_route(&self) -> VmforgeResult<Option<Route>>;
}

/// Prompt for every address (primary first, additionals in order), then for
/// extra static routes until the destination is left blank. Declining the
/// fallback aborts the build entirely.
pub(super) fn manual_configuration(
    primary: Ipv4Addr,
    additional: &[Ipv4Addr],
    prompt: &dyn NetworkPrompt,
) -> VmforgeResult<(Vec<AddressEntry>, Vec<Route>)> {
    if !prompt.confirm("Configure network manually?")? {
        return Err(VmforgeError::Aborted("could not configure network".into()));
    }

    let mut entries = Vec::with_capacity(1 + additional.len());
    for address in std::iter::once(primary).chain(additional.iter().copied()) {
        let netmask = prompt.netmask_for(address)?;
        let gateway = prompt.gateway_for(address)?;
        entries.push(AddressEntry {
            address,
            netmask,
            gateway,
        });
    }

    tracing::info!("Address configuration done, now add static routes; leave the destination blank to finish");

    let mut routes = Vec::new();
    while let Some(route) = prompt.next_route()? {
        routes.push(route);
    }

    Ok((entries, routes))
}

/// Terminal prompting via `inquire`.
#[derive(Default)]
pub struct InquirePrompt;

impl InquirePrompt {
    pub fn new() -> Self {
        Self
    }

    fn text_ipv4(&self, message: &str, optional: bool) -> VmforgeResult<Option<Ipv4Addr>> {
        let validator = move |input: &str| {
            let trimmed = input.trim();
            if optional && trimmed.is_empty() {
                return Ok(Validation::Valid);
            }
            match trimmed.parse::<Ipv4Addr>() {
                Ok(_) => Ok(Validation::Valid),
                Err(_) => Ok(Validation::Invalid(
                    "expected a dotted-quad IPv4 value".into(),
                )),
            }
        };

        let answer = Text::new(message)
            .with_validator(validator)
            .prompt()
            .map_err(prompt_aborted)?;

        let trimmed = answer.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let parsed = trimmed
            .parse::<Ipv4Addr>()
            .map_err(|_| VmforgeError::Network(format!("invalid address \"{trimmed}\"")))?;
        Ok(Some(parsed))
    }
}

fn prompt_aborted(err: inquire::InquireError) -> VmforgeError {
    VmforgeError::Aborted(format!("prompt closed: {err}"))
}

/// Prompting for automated contexts: declines every confirmation, so the
/// manual fallback is never entered and resolution failures stay fatal.
pub struct StrictPrompt;

impl NetworkPrompt for StrictPrompt {
    fn confirm(&self, message: &str) -> VmforgeResult<bool> {
        tracing::warn!(message, "Interactive prompting disabled, declining");
        Ok(false)
    }

    fn netmask_for(&self, _address: Ipv4Addr) -> VmforgeResult<Ipv4Addr> {
        Err(VmforgeError::Aborted("interactive prompting disabled".into()))
    }

    fn gateway_for(&self, _address: Ipv4Addr) -> VmforgeResult<Option<Ipv4Addr>> {
        Err(VmforgeError::Aborted("interactive prompting disabled".into()))
    }

    fn next_route(&self) -> VmforgeResult<Option<Route>> {
        Err(VmforgeError::Aborted("interactive prompting disabled".into()))
    }
}

impl NetworkPrompt for InquirePrompt {
    fn confirm(&self, message: &str) -> VmforgeResult<bool> {
        Confirm::new(message)
            .with_default(false)
            .prompt()
            .map_err(prompt_aborted)
    }

    fn netmask_for(&self, address: Ipv4Addr) -> VmforgeResult<Ipv4Addr> {
        self.text_ipv4(&format!("Netmask for {address}:"), false)?
            .ok_or_else(|| VmforgeError::Network("netmask is required".into()))
    }

    fn gateway_for(&self, address: Ipv4Addr) -> VmforgeResult<Option<Ipv4Addr>> {
        self.text_ipv4(&format!("Gateway for {address}:"), true)
    }

    fn next_route(&self) -> VmforgeResult<Option<Route>> {
        let Some(destination) = self.text_ipv4("Route destination:", true)? else {
            return Ok(None);
        };
        let netmask = self
            .text_ipv4("Route netmask:", false)?
            .ok_or_else(|| VmforgeError::Network("route netmask is required".into()))?;
        let gateway = self
            .text_ipv4("Route gateway:", false)?
            .ok_or_else(|| VmforgeError::Network("route gateway is required".into()))?;
        Ok(Some(Route {
            destination,
            netmask,
            gateway,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted prompt for resolver tests.
    pub(crate) struct ScriptedPrompt {
        confirm_answer: bool,
        addresses: Mutex<VecDeque<(Ipv4Addr, Ipv4Addr, Option<Ipv4Addr>)>>,
        routes: Mutex<VecDeque<Route>>,
        confirmed: AtomicBool,
    }

    impl ScriptedPrompt {
        pub(crate) fn accepting(
            addresses: Vec<(Ipv4Addr, Ipv4Addr, Option<Ipv4Addr>)>,
            routes: Vec<Route>,
        ) -> Self {
            Self {
                confirm_answer: true,
                addresses: Mutex::new(addresses.into()),
                routes: Mutex::new(routes.into()),
                confirmed: AtomicBool::new(false),
            }
        }

        pub(crate) fn declining() -> Self {
            Self {
                confirm_answer: false,
                addresses: Mutex::new(VecDeque::new()),
                routes: Mutex::new(VecDeque::new()),
                confirmed: AtomicBool::new(false),
            }
        }

        pub(crate) fn confirm_only(answer: bool) -> Self {
            Self {
                confirm_answer: answer,
                addresses: Mutex::new(VecDeque::new()),
                routes: Mutex::new(VecDeque::new()),
                confirmed: AtomicBool::new(false),
            }
        }

        pub(crate) fn fallback_confirmed(&self) -> bool {
            self.confirmed.load(Ordering::SeqCst)
        }
    }

    impl NetworkPrompt for ScriptedPrompt {
        fn confirm(&self, _message: &str) -> VmforgeResult<bool> {
            self.confirmed.store(true, Ordering::SeqCst);
            Ok(self.confirm_answer)
        }

        fn netmask_for(&self, address: Ipv4Addr) -> VmforgeResult<Ipv4Addr> {
            let queue = self.addresses.lock().unwrap();
            let (scripted, netmask, _) = queue
                .front()
                .copied()
                .expect("no scripted netmask left");
            assert_eq!(scripted, address, "addresses prompted out of order");
            Ok(netmask)
        }

        fn gateway_for(&self, address: Ipv4Addr) -> VmforgeResult<Option<Ipv4Addr>> {
            let mut queue = self.addresses.lock().unwrap();
            let (scripted, _, gateway) =
                queue.pop_front().expect("no scripted gateway left");
            assert_eq!(scripted, address, "addresses prompted out of order");
            Ok(gateway)
        }

        fn next_route(&self) -> VmforgeResult<Option<Route>> {
            Ok(self.routes.lock().unwrap().pop_front())
        }
    }

    #[test]
    fn manual_entry_covers_every_address_in_order() {
        let primary = Ipv4Addr::new(10, 0, 0, 10);
        let extra = Ipv4Addr::new(10, 0, 0, 11);
        let prompt = ScriptedPrompt::accepting(
            vec![
                (primary, Ipv4Addr::new(255, 255, 255, 0), Some(Ipv4Addr::new(10, 0, 0, 1))),
                (extra, Ipv4Addr::new(255, 255, 0, 0), None),
            ],
            vec![Route {
                destination: Ipv4Addr::new(10, 0, 0, 0),
                netmask: Ipv4Addr::new(255, 0, 0, 0),
                gateway: Ipv4Addr::new(10, 0, 0, 2),
            }],
        );

        let (entries, routes) = manual_configuration(primary, &[extra], &prompt).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].address, primary);
        assert_eq!(entries[0].gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(entries[1].address, extra);
        assert_eq!(entries[1].gateway, None);
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn declining_manual_entry_is_fatal() {
        let prompt = ScriptedPrompt::declining();
        let err = manual_configuration(Ipv4Addr::new(10, 0, 0, 10), &[], &prompt).unwrap_err();
        assert!(matches!(err, VmforgeError::Aborted(_)));
    }
}

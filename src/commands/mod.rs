/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

- `connect` -- `connect`, `callback` and `recent`, driving the orchestrator
- `inspect` -- `probe`, `discover` and `pkce`, exposing single building blocks
*/

pub mod connect;
pub mod inspect;

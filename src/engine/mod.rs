//! Sandbox lifecycle & file synchronization engine.
//!
//! ## Overview
//!
//! The engine binds a logical project to an ephemeral sandbox, keeps the
//! sandbox filesystem consistent with the persistent file store, and
//! mediates command execution and live HTTP preview through it.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, start_server)      │
//! └──────────┘          │    └─ api.rs  (route handlers, AppState)     │
//!                       │         │                                    │
//!                       │         v                                    │
//!                       │  service.rs  (Engine facade)                 │
//!                       │    │        │         │          │           │
//!                       │    v        v         v          v           │
//!                       │ registry  sync     runner      proxy         │
//!                       │    │        │  \      │          │           │
//!                       │    v        v   \     v          v           │
//!                       │ provider  store  walker   (reqwest upstream) │
//!                       └──────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Shared types: `Project`, `FileRecord`, `KillOutcome`    |
//! | `provider` | `SandboxProvider`/`Sandbox` traits + remote REST client |
//! | `local`    | In-process provider for dev mode and tests              |
//! | `registry` | Per-project sandbox cache with in-flight locks          |
//! | `store`    | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `sync`     | Batched restore (store → sandbox) and persist (→ store) |
//! | `walker`   | Recursive sandbox enumeration, artifact pruning         |
//! | `runner`   | Shell command execution in a cached sandbox             |
//! | `proxy`    | Preview forwarding + root-relative URL rewriting        |
//!
//! ## Typical Request Flow (provision)
//!
//! 1. `POST /api/projects/{id}/provision` → `api::provision()`
//! 2. `Engine::provision()` marks the project `provisioning` (or
//!    `reconnecting` when a stored sandbox id exists) and asks the
//!    registry for a handle.
//! 3. `SandboxRegistry::get_or_create()` serializes concurrent callers on
//!    a per-project lock, then: reuse the cached handle if the provider
//!    confirms it running (TTL refreshed), else reconnect by stored id,
//!    else create fresh.
//! 4. A fresh sandbox (`is_new`) is restored from the persisted file set
//!    in sequential batches before it is considered usable.
//! 5. The project row is updated with the sandbox id and `running` status.

pub mod api;
pub mod local;
pub mod models;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod runner;
pub mod server;
pub mod service;
pub mod store;
pub mod sync;
pub mod walker;

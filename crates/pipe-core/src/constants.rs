//! Constantes del motor.
//!
//! Nombres de campos persistidos (contrato con el document store) y valores
//! por defecto de la configuración. Cambiar cualquiera de los nombres de campo
//! rompe la compatibilidad con documentos ya existentes.

/// Lista ordenada de stages con sus flags `completed`.
pub const TASK_LIST_FIELD: &str = "task_list";
/// Mapa nombre de task -> expiración del lease (RFC 3339).
pub const TASK_LEASES_FIELD: &str = "task_leases";
/// Timestamp fijado por `on_create`.
pub const PROCESSING_STARTED_AT_FIELD: &str = "processing_started_at";
/// Timestamp del estado terminal; `null` hasta entonces.
pub const PROCESSING_COMPLETED_AT_FIELD: &str = "processing_completed_at";

/// Campos que sólo escribe el motor. Los handlers no pueden sobreescribirlos.
pub const RESERVED_FIELDS: [&str; 4] = [TASK_LIST_FIELD,
                                        TASK_LEASES_FIELD,
                                        PROCESSING_STARTED_AT_FIELD,
                                        PROCESSING_COMPLETED_AT_FIELD];

/// Duración por defecto de un lease (segundos).
pub const DEFAULT_LEASE_SECONDS: i64 = 120;
/// Duración máxima aceptada para un lease (7 días).
pub const MAX_LEASE_SECONDS: i64 = 7 * 24 * 60 * 60;
/// Campo del documento con tasks ad-hoc (array de strings).
pub const DEFAULT_CUSTOM_TASKS_FIELD: &str = "custom_tasks";
/// Nombre del stage sintético que agrupa las tasks ad-hoc.
pub const DEFAULT_CUSTOM_STAGE_NAME: &str = "custom";
/// Capacidad del canal broadcast de cambios.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;
/// Backoff inicial de redelivery (ms).
pub const DEFAULT_RETRY_INITIAL_MS: u64 = 200;
/// Backoff máximo de redelivery (ms).
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

/// mDNS service type advertised by Saturn backends
pub const SATURN_SERVICE_TYPE: &str = "_saturn._tcp.local.";

/// Service type used by the first generation of backends
pub const LEGACY_SERVICE_TYPE: &str = "_zeroconfai._tcp.local.";

/// TXT record keys carried by every backend advertisement
pub const TXT_VERSION: &str = "version";
pub const TXT_API: &str = "api";
pub const TXT_PRIORITY: &str = "priority";

/// Priority assumed when an advertisement declares none
pub const DEFAULT_PRIORITY: u16 = 50;

/// Backend endpoints the gateway depends on
pub const HEALTH_PATH: &str = "/v1/health";
pub const MODELS_PATH: &str = "/v1/models";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// SSE payload that terminates a chat completion stream
pub const SSE_DONE: &str = "[DONE]";

//! Fixed values shared by scenarios.

/// API server port used by the functional scenarios.
pub const API_PORT_TEST: u16 = 8441;

/// Port of the 9p server started by mount scenarios.
pub const MOUNT_PORT: u16 = 46464;

/// URL printed by `dashboard --url` once the proxy is up.
pub const DASHBOARD_URL_PATTERN: &str = r"^http://127\.0\.0\.1:[0-9]{5}/api/v1/namespaces/kubernetes-dashboard/services/http:kubernetes-dashboard:/proxy/$";

/// Name used for every profile when the `none` driver is active; it cannot
/// host more than one cluster.
pub const NONE_DRIVER_PROFILE: &str = "minikube";

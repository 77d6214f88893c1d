use shared::domain::{OrganizationConfig, Registry};

/// Schools shipped with the console. These are always selectable, never
/// persisted to the profile, and never mirrored to the cloud registry.
pub fn builtin_registry() -> Registry {
    let entries = [
        ("ibn-khaldun", "ابن خلدون", "https://api.system.ouredu.net/api/v1/ar"),
        (
            "dar-al-ahfad",
            "دار الاحفاد",
            "https://api.dar-al-ahfad.ouredu.net/api/v1/ar",
        ),
        (
            "al-taib",
            "الكلم الطيب",
            "https://api.altaib.system.ouredu.net/api/v1/ar",
        ),
        (
            "high-gate",
            "High Gate",
            "https://api.high-gate.system.ouredu.net/api/v1/ar",
        ),
        ("testing", "Testing", "https://testing.oetest.tech/api/v1/ar"),
        ("staging", "Staging", "https://oetest2.tech/api/v1/ar"),
    ];
    entries
        .into_iter()
        .map(|(key, name, base_url)| {
            (
                key.to_string(),
                OrganizationConfig {
                    name: name.to_string(),
                    base_url: base_url.to_string(),
                },
            )
        })
        .collect()
}

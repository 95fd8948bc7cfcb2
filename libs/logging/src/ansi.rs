/// Whether stdout supports ANSI color codes.
///
/// Honors `NO_COLOR` via [`supports_color`] and enables the Windows VT100 console mode as a
/// side effect on platforms where that matters.
pub fn stdout_supports_ansi() -> bool {
    supports_color::on(supports_color::Stream::Stdout).is_some()
}

//! The environment exported to a spawned app (`spec.md` §4.5).
//!
//! New, no teacher precedent — `assh`'s sessions never spawn a process.

use crate::pty::WindowSize;

/// Everything needed to build one app's environment, gathered from across
/// the connection and channel state by the time `shell`/`exec` fires.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub term: Option<String>,
    pub window: WindowSize,
    pub client_ip: String,
    pub tty_path: String,
    pub app: String,
    pub username: String,
    pub connection_id: String,
    pub user_public_key: Option<String>,
    pub params: Vec<(String, String)>,
}

/// Build the `(name, value)` pairs to export to the spawned app, in
/// addition to the inherited `PATH` (handled by the caller's `Command`).
pub fn build(ctx: &Context) -> Vec<(String, String)> {
    let mut vars = Vec::new();

    if let Some(term) = &ctx.term {
        vars.push(("TERM".to_owned(), term.clone()));
        vars.push(("WHISP_TERM".to_owned(), term.clone()));
    }

    vars.push(("WHISP_COLS".to_owned(), ctx.window.cols.to_string()));
    vars.push(("WHISP_ROWS".to_owned(), ctx.window.rows.to_string()));
    vars.push((
        "WHISP_WIDTH_PX".to_owned(),
        ctx.window.width_px.to_string(),
    ));
    vars.push((
        "WHISP_HEIGHT_PX".to_owned(),
        ctx.window.height_px.to_string(),
    ));
    vars.push(("WHISP_CLIENT_IP".to_owned(), ctx.client_ip.clone()));
    vars.push(("WHISP_TTY".to_owned(), ctx.tty_path.clone()));
    vars.push(("WHISP_APP".to_owned(), ctx.app.clone()));
    vars.push(("WHISP_USERNAME".to_owned(), ctx.username.clone()));
    vars.push((
        "WHISP_CONNECTION_ID".to_owned(),
        ctx.connection_id.clone(),
    ));

    if let Some(key) = &ctx.user_public_key {
        vars.push(("WHISP_USER_PUBLIC_KEY".to_owned(), key.clone()));
    }

    for (name, value) in &ctx.params {
        vars.push((format!("WHISP_PARAM_{}", name.to_uppercase()), value.clone()));
    }

    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_the_documented_variables_for_a_shell_start() {
        let ctx = Context {
            term: Some("xterm-256color".into()),
            window: WindowSize {
                cols: 80,
                rows: 24,
                width_px: 0,
                height_px: 0,
            },
            client_ip: "127.0.0.1".into(),
            tty_path: "/dev/pts/4".into(),
            app: "default".into(),
            username: String::new(),
            connection_id: "conn-1".into(),
            user_public_key: None,
            params: Vec::new(),
        };

        let vars = build(&ctx);

        assert!(vars.contains(&("WHISP_COLS".to_owned(), "80".to_owned())));
        assert!(vars.contains(&("WHISP_ROWS".to_owned(), "24".to_owned())));
        assert!(vars.contains(&("WHISP_APP".to_owned(), "default".to_owned())));
        assert!(vars.contains(&("TERM".to_owned(), "xterm-256color".to_owned())));
        assert!(!vars.iter().any(|(name, _)| name == "WHISP_USER_PUBLIC_KEY"));
    }

    #[test]
    fn uppercases_captured_parameter_names() {
        let ctx = Context {
            params: vec![("room".to_owned(), "lobby".to_owned())],
            ..Default::default()
        };

        let vars = build(&ctx);
        assert!(vars.contains(&("WHISP_PARAM_ROOM".to_owned(), "lobby".to_owned())));
    }
}

use anyhow::Result;

use crate::RconClient;

const COLOR_CODES: &str = "0123456789AaBbCcDdEeFfKkLlMmNnOoRrXx";

/// Replace `&x` colour codes with the `§x` form the client renders.
pub fn translate_color_codes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match chars.peek() {
            Some(&next) if c == '&' && COLOR_CODES.contains(next) => {
                out.push('§');
                out.push(next.to_ascii_lowercase());
                chars.next();
            }
            _ => out.push(c),
        }
    }
    out
}

/// Send a chat line to every player.
pub async fn broadcast(client: &RconClient, message: &str) -> Result<()> {
    let line = translate_color_codes(message);
    client.execute(&format!("say {line}")).await?;
    Ok(())
}

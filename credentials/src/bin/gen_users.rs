use clap::Parser;
use credentials::UsersFile;
use rand::RngExt;
use std::path::PathBuf;

const ALLOWED_CHARS: [char; 35] = [
    '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n',
    'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];
const PASSWORD_LEN: usize = 12;

fn make_password(rng: &mut impl rand::Rng) -> String {
    (0..PASSWORD_LEN)
        .map(|_| ALLOWED_CHARS[rng.random_range(0..ALLOWED_CHARS.len())])
        .collect()
}

#[derive(Parser)]
#[command(name = "gen_users", version, about = "Adds a screenname to the authenticator's user file")]
struct Args {
    /// Path to the users JSON file (created if absent).
    users_file: PathBuf,

    /// Screenname to add.
    screenname: String,

    /// Password to set; a random one is generated if omitted.
    #[arg(long)]
    password: Option<String>,
}

fn main() {
    let args = Args::parse();

    let mut file: UsersFile = if args.users_file.exists() {
        let raw = std::fs::read_to_string(&args.users_file).expect("failed to read users file");
        serde_json::from_str(&raw).expect("failed to parse users file")
    } else {
        UsersFile::default()
    };

    let password = args.password.unwrap_or_else(|| {
        let mut rng = rand::rng();
        make_password(&mut rng)
    });

    if file.users.contains_key(&args.screenname) {
        eprintln!("screenname `{}` already exists, overwriting password", args.screenname);
    }
    file.users.insert(args.screenname.clone(), password.clone());

    let raw = serde_json::to_string_pretty(&file).expect("failed to serialize users file");
    std::fs::write(&args.users_file, raw).expect("failed to write users file");

    println!("added `{}` with password `{}`", args.screenname, password);
}

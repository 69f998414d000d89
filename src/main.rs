use rocket::launch;

#[launch]
fn rocket() -> _ {
    let rocket = list_archiver::rocket();
    log::info!("starting list archiver");
    rocket
}
